//! Context menu entries and their on/off toggles.

use std::fmt;
use std::str::FromStr;

use crate::store::{self, KeyValueStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MenuItem {
    AddAnnotation,
    Search,
    AskAi,
    Rewrite,
}

impl MenuItem {
    pub const ALL: [MenuItem; 4] = [
        MenuItem::AddAnnotation,
        MenuItem::Search,
        MenuItem::AskAi,
        MenuItem::Rewrite,
    ];

    pub fn id(self) -> &'static str {
        match self {
            MenuItem::AddAnnotation => "add-annotation-on-oi-wiki",
            MenuItem::Search => "search-on-oi-wiki",
            MenuItem::AskAi => "ask-ai",
            MenuItem::Rewrite => "rewrite-text",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.id() == id)
    }

    pub fn title(self) -> &'static str {
        match self {
            MenuItem::AddAnnotation => "添加 OI-Wiki 注释",
            MenuItem::Search => "在 OI-Wiki 中查询",
            MenuItem::AskAi => "对 AI 提问",
            MenuItem::Rewrite => "优化此段落 (AI)",
        }
    }

    /// Synced key holding the toggle.
    pub fn setting_key(self) -> &'static str {
        match self {
            MenuItem::AddAnnotation => "contextMenu_addAnnotation",
            MenuItem::Search => "contextMenu_search",
            MenuItem::AskAi => "contextMenu_askAI",
            MenuItem::Rewrite => "contextMenu_rewrite",
        }
    }
}

impl fmt::Display for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for MenuItem {
    type Err = String;

    /// Accepts the entry id or a short alias (`annotate`, `search`, `ask`, `rewrite`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let item = match s {
            "annotate" | "add-annotation" => Some(MenuItem::AddAnnotation),
            "search" => Some(MenuItem::Search),
            "ask" => Some(MenuItem::AskAi),
            "rewrite" => Some(MenuItem::Rewrite),
            other => MenuItem::from_id(other),
        };
        item.ok_or_else(|| format!("unknown menu entry: {s}"))
    }
}

/// Per-entry toggles. Missing keys mean enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuSettings {
    pub add_annotation: bool,
    pub search: bool,
    pub ask_ai: bool,
    pub rewrite: bool,
}

impl Default for MenuSettings {
    fn default() -> Self {
        Self {
            add_annotation: true,
            search: true,
            ask_ai: true,
            rewrite: true,
        }
    }
}

impl MenuSettings {
    pub async fn load(synced: &dyn KeyValueStore) -> Result<Self, StoreError> {
        let mut settings = Self::default();
        for item in MenuItem::ALL {
            if let Some(enabled) = store::load::<bool>(synced, item.setting_key()).await? {
                settings.set(item, enabled);
            }
        }
        Ok(settings)
    }

    pub async fn save(&self, synced: &dyn KeyValueStore) -> Result<(), StoreError> {
        for item in MenuItem::ALL {
            store::save(synced, item.setting_key(), &self.is_enabled(item)).await?;
        }
        Ok(())
    }

    pub fn is_enabled(&self, item: MenuItem) -> bool {
        match item {
            MenuItem::AddAnnotation => self.add_annotation,
            MenuItem::Search => self.search,
            MenuItem::AskAi => self.ask_ai,
            MenuItem::Rewrite => self.rewrite,
        }
    }

    pub fn set(&mut self, item: MenuItem, enabled: bool) {
        let slot = match item {
            MenuItem::AddAnnotation => &mut self.add_annotation,
            MenuItem::Search => &mut self.search,
            MenuItem::AskAi => &mut self.ask_ai,
            MenuItem::Rewrite => &mut self.rewrite,
        };
        *slot = enabled;
    }

    /// Enabled entries in menu order.
    pub fn enabled_items(&self) -> Vec<MenuItem> {
        MenuItem::ALL
            .into_iter()
            .filter(|&item| self.is_enabled(item))
            .collect()
    }
}

/// Flips one toggle in the synced store and returns the new settings.
pub async fn set_enabled(
    synced: &dyn KeyValueStore,
    item: MenuItem,
    enabled: bool,
) -> Result<MenuSettings, StoreError> {
    store::save(synced, item.setting_key(), &enabled).await?;
    MenuSettings::load(synced).await
}
