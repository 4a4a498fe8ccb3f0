//! Every column and every prototype accepts exactly the contracted vectors.

use embedstore::{EmbedError, EntityTable, PrototypeKey, RecordId, Substrate, VectorError};

use crate::support::settings;

#[test]
fn test_zero_vector_round_trips_in_every_table() {
    let substrate = Substrate::in_memory(settings(384)).unwrap();
    let zeros = vec![0.0f32; 384];

    for table in EntityTable::ALL {
        let id = RecordId::new(1);
        substrate.upsert_record(table, id, Some(zeros.clone())).unwrap();
        let stored = substrate.get_embedding(table, id).unwrap().unwrap();
        assert_eq!(stored.as_slice(), zeros.as_slice());
    }
}

#[test]
fn test_wrong_width_is_rejected_everywhere() {
    let substrate = Substrate::in_memory(settings(384)).unwrap();
    let short = vec![0.0f32; 300];

    for table in EntityTable::ALL {
        let err = substrate
            .upsert_record(table, RecordId::new(1), Some(short.clone()))
            .unwrap_err();
        assert!(matches!(
            err,
            EmbedError::Vector(VectorError::DimensionMismatch {
                expected: 384,
                actual: 300
            })
        ));
        assert!(!substrate.store().contains(table, RecordId::new(1)));
    }

    let err = substrate
        .assign(&PrototypeKey::from("topicA"), &short)
        .unwrap_err();
    assert_eq!(err.status_code(), "DIMENSION_MISMATCH");
    assert!(substrate.prototype(&PrototypeKey::from("topicA")).is_none());
}

#[test]
fn test_non_finite_values_are_rejected() {
    let substrate = Substrate::in_memory(settings(4)).unwrap();
    substrate
        .upsert_record(EntityTable::Images, RecordId::new(9), Some(vec![1.0; 4]))
        .unwrap();

    let err = substrate
        .set_embedding(
            EntityTable::Images,
            RecordId::new(9),
            Some(vec![1.0, f32::INFINITY, 0.0, 0.0]),
        )
        .unwrap_err();
    assert!(err.is_validation());

    // The previous value is untouched
    let stored = substrate
        .get_embedding(EntityTable::Images, RecordId::new(9))
        .unwrap()
        .unwrap();
    assert_eq!(stored.as_slice(), &[1.0; 4]);
}

#[test]
fn test_null_embedding_is_allowed_and_not_searched() {
    let substrate = Substrate::in_memory(settings(2)).unwrap();
    substrate
        .upsert_record(EntityTable::GraphNodes, RecordId::new(1), None)
        .unwrap();
    substrate
        .upsert_record(EntityTable::GraphNodes, RecordId::new(2), Some(vec![1.0, 1.0]))
        .unwrap();

    assert_eq!(
        substrate
            .get_embedding(EntityTable::GraphNodes, RecordId::new(1))
            .unwrap(),
        None
    );
    let result = substrate
        .search(EntityTable::GraphNodes, &[0.0, 0.0], 10, Default::default())
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].id, RecordId::new(2));
}

#[test]
fn test_unknown_record_reports_not_found() {
    let substrate = Substrate::in_memory(settings(2)).unwrap();
    assert!(matches!(
        substrate.get_embedding(EntityTable::Documents, RecordId::new(77)),
        Err(EmbedError::RecordNotFound { .. })
    ));
}
