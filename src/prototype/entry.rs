//! A single prototype row and its incremental centroid arithmetic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult};
use crate::prototype::PrototypeKey;
use crate::vector::Embedding;

/// Open-ended metadata attached to a prototype.
pub type PrototypeMetadata = BTreeMap<String, serde_json::Value>;

/// One row of the prototypes table.
///
/// The centroid is kept as an `f64` running mean so that add/remove pairs
/// cancel out well below `f32` resolution; readers get it back as an
/// [`Embedding`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    key: PrototypeKey,
    topic: Option<String>,
    document: Option<String>,
    running_mean: Option<Vec<f64>>,
    member_count: u64,
    #[serde(default)]
    metadata: PrototypeMetadata,
    /// Highest journal sequence applied to this row.
    #[serde(default)]
    seq: u64,
}

impl Prototype {
    /// An empty prototype; topic and document come from the key convention.
    pub fn new(key: PrototypeKey) -> Self {
        let topic = key.topic().map(str::to_string);
        let document = key.document().map(str::to_string);
        Self {
            key,
            topic,
            document,
            running_mean: None,
            member_count: 0,
            metadata: PrototypeMetadata::new(),
            seq: 0,
        }
    }

    pub fn key(&self) -> &PrototypeKey {
        &self.key
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn document(&self) -> Option<&str> {
        self.document.as_deref()
    }

    pub fn member_count(&self) -> u64 {
        self.member_count
    }

    pub fn metadata(&self) -> &PrototypeMetadata {
        &self.metadata
    }

    /// Mean of the current members, `None` while there are none.
    pub fn centroid(&self) -> Option<Embedding> {
        self.running_mean
            .as_ref()
            .map(|mean| Embedding::from_trusted(mean.iter().map(|&x| x as f32).collect()))
    }

    pub(crate) fn centroid_f64(&self) -> Option<&[f64]> {
        self.running_mean.as_deref()
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn stamp(&mut self, seq: u64) {
        self.seq = self.seq.max(seq);
    }

    pub(crate) fn describe(
        &mut self,
        topic: Option<String>,
        document: Option<String>,
        metadata: PrototypeMetadata,
    ) {
        if topic.is_some() {
            self.topic = topic;
        }
        if document.is_some() {
            self.document = document;
        }
        self.metadata.extend(metadata);
    }

    /// `centroid' = centroid + (v - centroid) / count'`
    pub(crate) fn add_member(&mut self, vector: &[f32]) {
        self.member_count += 1;
        let n = self.member_count as f64;
        match self.running_mean.as_mut() {
            Some(mean) => {
                for (m, &x) in mean.iter_mut().zip(vector) {
                    *m += (f64::from(x) - *m) / n;
                }
            }
            None => {
                self.running_mean = Some(vector.iter().map(|&x| f64::from(x)).collect());
            }
        }
    }

    /// Fails with `EmptyPrototype` when there is nothing to remove.
    pub(crate) fn ensure_removable(&self) -> EmbedResult<()> {
        if self.member_count == 0 {
            return Err(EmbedError::EmptyPrototype {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// `centroid' = centroid + (centroid - v) / count'`, clearing the
    /// centroid when the count reaches zero. Call `ensure_removable` first.
    pub(crate) fn remove_member(&mut self, vector: &[f32]) {
        debug_assert!(self.member_count > 0);
        self.member_count -= 1;
        if self.member_count == 0 {
            self.running_mean = None;
            return;
        }
        let n = self.member_count as f64;
        if let Some(mean) = self.running_mean.as_mut() {
            for (m, &x) in mean.iter_mut().zip(vector) {
                *m += (*m - f64::from(x)) / n;
            }
        }
    }

    /// Replaces the aggregate wholesale (topic rollups).
    pub(crate) fn overwrite(&mut self, mean: Vec<f64>, member_count: u64) {
        self.running_mean = (member_count > 0).then_some(mean);
        self.member_count = member_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto() -> Prototype {
        Prototype::new(PrototypeKey::from("topicA"))
    }

    fn centroid(p: &Prototype) -> Vec<f32> {
        p.centroid().unwrap().into_inner()
    }

    #[test]
    fn test_new_prototype_is_empty() {
        let p = Prototype::new(PrototypeKey::for_document_topic("d1", "tax"));
        assert_eq!(p.member_count(), 0);
        assert!(p.centroid().is_none());
        assert_eq!(p.topic(), Some("tax"));
        assert_eq!(p.document(), Some("d1"));
    }

    #[test]
    fn test_incremental_mean_of_two_members() {
        let mut p = proto();
        p.add_member(&[1.0, 0.0, 0.0]);
        p.add_member(&[0.0, 1.0, 0.0]);
        assert_eq!(p.member_count(), 2);
        assert_eq!(centroid(&p), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_remove_reverses_add() {
        let mut p = proto();
        p.add_member(&[0.3, -1.2, 7.0]);
        p.add_member(&[2.5, 0.1, -3.3]);
        let before = centroid(&p);

        p.add_member(&[9.9, 4.4, 0.01]);
        p.ensure_removable().unwrap();
        p.remove_member(&[9.9, 4.4, 0.01]);

        assert_eq!(p.member_count(), 2);
        for (a, b) in centroid(&p).iter().zip(before.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_removing_last_member_clears_centroid() {
        let mut p = proto();
        p.add_member(&[1.0, 1.0]);
        p.remove_member(&[1.0, 1.0]);
        assert_eq!(p.member_count(), 0);
        assert!(p.centroid().is_none());
    }

    #[test]
    fn test_empty_prototype_is_not_removable() {
        assert!(matches!(
            proto().ensure_removable(),
            Err(EmbedError::EmptyPrototype { .. })
        ));
    }

    #[test]
    fn test_describe_merges_metadata() {
        let mut p = proto();
        let mut md = PrototypeMetadata::new();
        md.insert("source".into(), serde_json::json!("manual"));
        p.describe(Some("tax".into()), None, md);
        assert_eq!(p.topic(), Some("tax"));
        assert_eq!(p.metadata()["source"], "manual");
    }
}
