//! Persisted keyword → explanation map, and the entries seeded on install.

use indexmap::IndexMap;

use crate::store::{self, keys, KeyValueStore, StoreError};

/// Insertion-ordered so ties between equal-length keywords are stable.
pub type AnnotationMap = IndexMap<String, String>;

/// Entries shipped with the extension. User entries with the same key win.
pub fn predefined() -> AnnotationMap {
    [
        (
            "松弛",
            "在最短路算法中，松弛操作是指更新从源点到某个顶点的最短距离估计值。如果通过一个新路径可以得到更短的距离，则更新该顶点的距离值。",
        ),
        (
            "border",
            "在KMP算法中，字符串的border是指既是该字符串的前缀又是其后缀的字符串。例如，'ababa'的border有'a'和'aba'。",
        ),
        (
            "pi数组",
            "在KMP算法中，pi数组（也叫next数组）存储了字符串每个前缀的最长border的长度。它用于在文本匹配中高效地移动模式串的位置。",
        ),
        (
            "度",
            "在图论中，一个顶点的度（degree）是指与该顶点相关联的边的数量，记作 $d(v) = |N(v)|$，其中 $N(v)$ 是顶点 $v$ 的邻居集合。",
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub async fn load(synced: &dyn KeyValueStore) -> Result<AnnotationMap, StoreError> {
    Ok(store::load(synced, keys::ANNOTATIONS).await?.unwrap_or_default())
}

pub async fn save(synced: &dyn KeyValueStore, annotations: &AnnotationMap) -> Result<(), StoreError> {
    store::save(synced, keys::ANNOTATIONS, annotations).await
}

/// Adds or replaces one entry. An empty explanation masks the term.
pub async fn upsert(synced: &dyn KeyValueStore, key: &str, explanation: &str) -> Result<(), StoreError> {
    let mut annotations = load(synced).await?;
    annotations.insert(key.to_string(), explanation.to_string());
    save(synced, &annotations).await
}

/// Returns whether the key existed.
pub async fn remove(synced: &dyn KeyValueStore, key: &str) -> Result<bool, StoreError> {
    let mut annotations = load(synced).await?;
    let existed = annotations.shift_remove(key).is_some();
    if existed {
        save(synced, &annotations).await?;
    }
    Ok(existed)
}

/// Merges the predefined entries under whatever the user already has.
pub async fn seed(synced: &dyn KeyValueStore) -> Result<AnnotationMap, StoreError> {
    let existing = load(synced).await?;
    let mut merged = predefined();
    merged.extend(existing);
    save(synced, &merged).await?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let synced = MemoryStore::new();
        upsert(&synced, "线段树", "区间查询").await.unwrap();
        upsert(&synced, "度", "").await.unwrap();

        let annotations = load(&synced).await.unwrap();
        assert_eq!(annotations.get("线段树").map(String::as_str), Some("区间查询"));
        assert_eq!(annotations.get("度").map(String::as_str), Some(""));
        assert_eq!(annotations.keys().collect::<Vec<_>>(), vec!["线段树", "度"]);

        assert!(remove(&synced, "线段树").await.unwrap());
        assert!(!remove(&synced, "线段树").await.unwrap());
        assert_eq!(load(&synced).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seed_keeps_user_entries() {
        let synced = MemoryStore::new();
        upsert(&synced, "度", "").await.unwrap();
        upsert(&synced, "哈希", "散列").await.unwrap();

        let merged = seed(&synced).await.unwrap();
        assert_eq!(merged.get("度").map(String::as_str), Some(""));
        assert_eq!(merged.get("哈希").map(String::as_str), Some("散列"));
        assert!(merged.contains_key("松弛"));
        assert_eq!(merged.len(), 5);
        assert_eq!(load(&synced).await.unwrap(), merged);
    }
}
