use serde::Serialize;
use std::collections::HashMap;

use crate::core::cluster::cluster;
use crate::core::hash::Fingerprint;
use crate::core::with_workers;
use crate::database::models::{Item, ItemId};
use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    pub threshold: u32,
    pub scanned: usize,
    /// Near-duplicate groups, largest first, items in id order.
    pub clusters: Vec<Vec<Item>>,
}

/// Group every item of `store` into clusters of perceptually similar images.
/// Read only; deciding what to keep is up to the caller.
pub fn deduplicate(store: &mut Store, threshold: Option<u32>) -> Result<DedupReport> {
    let threshold = threshold.unwrap_or(store.config().dedup.threshold);
    let workers = store.config().worker_count();
    let items = store.list()?;
    let scanned = items.len();

    let pairs: Vec<(ItemId, Fingerprint)> =
        items.iter().map(|item| (item.id, item.fingerprint)).collect();
    log::info!(
        "Clustering {} items at threshold {} on {} workers",
        scanned,
        threshold,
        workers
    );
    let found = with_workers(workers, || cluster(&pairs, threshold));

    let by_id: HashMap<ItemId, Item> = items.into_iter().map(|item| (item.id, item)).collect();
    let mut clusters: Vec<Vec<Item>> = found
        .into_iter()
        .map(|group| {
            group
                .ids
                .iter()
                .filter_map(|id| by_id.get(id).cloned())
                .collect()
        })
        .collect();
    clusters.sort_by(|a: &Vec<Item>, b: &Vec<Item>| {
        b.len()
            .cmp(&a.len())
            .then_with(|| a.first().map(|i| i.id).cmp(&b.first().map(|i| i.id)))
    });

    log::info!("Found {} duplicate clusters", clusters.len());
    Ok(DedupReport {
        threshold,
        scanned,
        clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::database::models::NewItem;
    use crate::database::now;
    use tempfile::TempDir;

    fn store_with(fingerprints: &[u64]) -> (TempDir, Store) {
        let temp_dir = TempDir::new().unwrap();
        let mut store =
            Store::create(&temp_dir.path().join("store"), StoreConfig::default()).unwrap();
        for bits in fingerprints {
            store
                .items()
                .unwrap()
                .insert(&NewItem::new("jpg", Fingerprint::new(*bits)), now())
                .unwrap();
        }
        (temp_dir, store)
    }

    fn ids(report: &DedupReport) -> Vec<Vec<ItemId>> {
        report
            .clusters
            .iter()
            .map(|c| c.iter().map(|item| item.id).collect())
            .collect()
    }

    #[test]
    fn test_groups_near_duplicates() {
        // 1 and 2 differ by 3 bits, 3 and 4 are identical, 5 is far away.
        let (_dir, mut store) = store_with(&[0, 0b111, u64::MAX, u64::MAX, 0xFFFF_0000_0000_0000]);
        let report = deduplicate(&mut store, None).unwrap();

        assert_eq!(report.scanned, 5);
        assert_eq!(report.threshold, 10);
        assert_eq!(ids(&report), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_threshold_override() {
        let (_dir, mut store) = store_with(&[0, 0b111, 0b1111_1111]);

        let strict = deduplicate(&mut store, Some(2)).unwrap();
        assert!(strict.clusters.is_empty());

        let loose = deduplicate(&mut store, Some(8)).unwrap();
        assert_eq!(ids(&loose), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_empty_store() {
        let (_dir, mut store) = store_with(&[]);
        let report = deduplicate(&mut store, None).unwrap();
        assert_eq!(report.scanned, 0);
        assert!(report.clusters.is_empty());
    }
}
