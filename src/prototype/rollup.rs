//! Derived views over the prototypes table: global topic rollups, the topic
//! catalog and topic/document coverage links.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::prototype::{Prototype, PrototypeKey, PrototypeMetadata};
use crate::vector::{RecordId, cosine_similarity};

/// Metadata tag marking rows produced by [`plan_topic_rollups`].
pub const ROLLUP_KIND: &str = "topic_rollup";

/// A global topic prototype computed from per-document prototypes.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRollup {
    pub key: PrototypeKey,
    pub topic: String,
    pub mean: Vec<f64>,
    pub documents: u64,
}

impl TopicRollup {
    pub fn metadata(&self) -> PrototypeMetadata {
        let mut metadata = PrototypeMetadata::new();
        metadata.insert("kind".into(), serde_json::json!(ROLLUP_KIND));
        metadata.insert("documents".into(), serde_json::json!(self.documents));
        metadata
    }
}

/// Plans rollups for the `limit` topics found in the most documents.
///
/// Only per-document prototypes with a defined centroid contribute. Each
/// rollup centroid is the unweighted mean of its documents' centroids and its
/// member count is the number of contributing documents. Ties in document
/// frequency are broken by topic name.
pub fn plan_topic_rollups(rows: &[Prototype], limit: usize) -> Vec<TopicRollup> {
    let mut by_topic: BTreeMap<&str, (Vec<f64>, u64)> = BTreeMap::new();

    for row in rows {
        let (Some(topic), Some(_), Some(centroid)) =
            (row.topic(), row.document(), row.centroid_f64())
        else {
            continue;
        };
        let entry = by_topic
            .entry(topic)
            .or_insert_with(|| (vec![0.0; centroid.len()], 0));
        for (sum, &x) in entry.0.iter_mut().zip(centroid) {
            *sum += x;
        }
        entry.1 += 1;
    }

    let mut ranked: Vec<(&str, (Vec<f64>, u64))> = by_topic.into_iter().collect();
    ranked.sort_by(|a, b| b.1.1.cmp(&a.1.1).then_with(|| a.0.cmp(b.0)));
    ranked.truncate(limit);

    ranked
        .into_iter()
        .map(|(topic, (sum, documents))| TopicRollup {
            key: PrototypeKey::for_topic(topic),
            topic: topic.to_string(),
            mean: sum.into_iter().map(|s| s / documents as f64).collect(),
            documents,
        })
        .collect()
}

/// One row of the topic catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub key: PrototypeKey,
    pub topic: Option<String>,
    pub member_count: u64,
}

/// Global topic prototypes, largest first.
pub fn catalog(rows: &[Prototype], limit: usize) -> Vec<CatalogEntry> {
    let mut entries: Vec<CatalogEntry> = rows
        .iter()
        .filter(|p| p.key().is_global_topic())
        .map(|p| CatalogEntry {
            key: p.key().clone(),
            topic: p.topic().map(str::to_string),
            member_count: p.member_count(),
        })
        .collect();
    entries.sort_by(|a, b| {
        b.member_count
            .cmp(&a.member_count)
            .then_with(|| a.key.cmp(&b.key))
    });
    entries.truncate(limit);
    entries
}

/// Edge between a topic prototype and a document it covers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageLink {
    pub topic: PrototypeKey,
    pub document: RecordId,
    pub similarity: f32,
}

/// Links every topic centroid to the documents whose embedding has cosine
/// similarity of at least `min_similarity`, strongest first per topic.
pub fn coverage_links<'a>(
    topics: &[(PrototypeKey, Vec<f32>)],
    documents: impl IntoIterator<Item = (RecordId, &'a [f32])> + Clone,
    min_similarity: f32,
) -> Vec<CoverageLink> {
    let mut links = Vec::new();
    for (topic, centroid) in topics {
        let mut for_topic: Vec<CoverageLink> = documents
            .clone()
            .into_iter()
            .filter_map(|(document, vector)| {
                let similarity = cosine_similarity(centroid, vector);
                (similarity >= min_similarity).then(|| CoverageLink {
                    topic: topic.clone(),
                    document,
                    similarity,
                })
            })
            .collect();
        for_topic.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.document.cmp(&b.document))
        });
        links.extend(for_topic);
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_doc(document: &str, topic: &str, members: &[&[f32]]) -> Prototype {
        let mut p = Prototype::new(PrototypeKey::for_document_topic(document, topic));
        for m in members {
            p.add_member(m);
        }
        p
    }

    #[test]
    fn test_rollups_rank_by_document_frequency() {
        let rows = vec![
            per_doc("d1", "tax", &[&[1.0, 0.0]]),
            per_doc("d2", "tax", &[&[0.0, 1.0], &[0.0, 1.0]]),
            per_doc("d1", "fees", &[&[2.0, 2.0]]),
            // empty per-document rows do not count
            per_doc("d3", "fees", &[]),
        ];

        let rollups = plan_topic_rollups(&rows, 10);
        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[0].key, PrototypeKey::for_topic("tax"));
        assert_eq!(rollups[0].documents, 2);
        assert_eq!(rollups[0].mean, vec![0.5, 0.5]);
        assert_eq!(rollups[1].topic, "fees");
        assert_eq!(rollups[1].documents, 1);

        assert_eq!(plan_topic_rollups(&rows, 1).len(), 1);
    }

    #[test]
    fn test_catalog_lists_global_topics_by_size() {
        let mut small = Prototype::new(PrototypeKey::for_topic("a"));
        small.add_member(&[0.0]);
        let mut big = Prototype::new(PrototypeKey::for_topic("b"));
        big.add_member(&[0.0]);
        big.add_member(&[0.0]);
        let local = per_doc("d1", "c", &[&[0.0], &[0.0], &[0.0]]);

        let entries = catalog(&[small, big, local], 10);
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["topic:b", "topic:a"]);
    }

    #[test]
    fn test_coverage_links_apply_threshold() {
        let topics = vec![(PrototypeKey::for_topic("x"), vec![1.0, 0.0])];
        let docs: Vec<(RecordId, Vec<f32>)> = vec![
            (RecordId::new(1), vec![1.0, 0.1]),
            (RecordId::new(2), vec![0.0, 1.0]),
            (RecordId::new(3), vec![0.5, 0.5]),
        ];
        let links = coverage_links(
            &topics,
            docs.iter().map(|(id, v)| (*id, v.as_slice())),
            0.30,
        );
        let ids: Vec<u64> = links.iter().map(|l| l.document.get()).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
