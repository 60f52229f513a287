use autopart::catalog::DEFAULT_SCHEMA;
use autopart::catalog::schema::{ColumnDef, PartitionParams, PartitionParamsUpdate};
use autopart::catalog::types::{ColumnType, Interval, TableId, Value};
use autopart::config::AutopartConfig;
use autopart::error::AutopartErrorCode;
use autopart::partition::bound::Bound;
use autopart::partition::router::Located;
use autopart::session::SessionContext;
use autopart::{PartitionEngine, RangePartitioning};
use chrono::NaiveDate;
use std::sync::{Arc, Mutex};

fn fin(v: i64) -> Bound {
    Bound::Finite(Value::Integer(v))
}

fn engine_with(config: AutopartConfig) -> (PartitionEngine, SessionContext) {
    let engine = PartitionEngine::new(config).expect("engine");
    let session = engine.session();
    (engine, session)
}

fn range_table(
    engine: &PartitionEngine,
    session: &SessionContext,
    bounds: Vec<(Bound, Bound)>,
    interval: i64,
) -> TableId {
    let parent = engine
        .create_table(
            DEFAULT_SCHEMA,
            "events",
            vec![ColumnDef::new("k", ColumnType::Integer)],
            None,
        )
        .expect("table");
    engine
        .create_range_partitioning(
            session,
            parent,
            RangePartitioning::new("k", Some(Value::Integer(interval))).with_bounds(bounds),
        )
        .expect("partitioning");
    engine.commit_session(session).expect("commit");
    parent
}

fn ranges(engine: &PartitionEngine, parent: TableId) -> Vec<(Bound, Bound)> {
    engine
        .partition_map(parent)
        .expect("map")
        .range_entries()
        .iter()
        .map(|e| (e.lower.clone(), e.upper.clone()))
        .collect()
}

#[test]
fn appends_until_the_value_is_covered() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(&engine, &session, vec![(fin(0), fin(100))], 50);

    assert_eq!(
        engine.locate(parent, &Value::Integer(150)).expect("locate"),
        Located::None
    );
    let id = engine
        .obtain_partition(&session, parent, &Value::Integer(150))
        .expect("spawn");

    assert_eq!(
        ranges(&engine, parent),
        vec![
            (fin(0), fin(100)),
            (fin(100), fin(150)),
            (fin(150), fin(200))
        ]
    );
    let last = engine.partition_map(parent).expect("map").range_entries()[2].partition_id;
    assert_eq!(id, last);
    assert_eq!(
        engine.locate(parent, &Value::Integer(150)).expect("locate"),
        Located::One(id)
    );
    assert_eq!(engine.metrics().partitions_spawned, 2);
    assert_eq!(engine.table(id).expect("schema").table_name, "events_3");
}

#[test]
fn prepends_below_the_lowest_partition() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(&engine, &session, vec![(fin(100), fin(200))], 50);
    let id = engine
        .obtain_partition(&session, parent, &Value::Integer(20))
        .expect("spawn");
    assert_eq!(
        ranges(&engine, parent),
        vec![
            (fin(0), fin(50)),
            (fin(50), fin(100)),
            (fin(100), fin(200))
        ]
    );
    assert_eq!(
        engine.locate(parent, &Value::Integer(20)).expect("locate"),
        Located::One(id)
    );
}

#[test]
fn upper_bound_belongs_to_the_next_partition() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(
        &engine,
        &session,
        vec![(fin(0), fin(100)), (fin(100), fin(200))],
        100,
    );
    let map = engine.partition_map(parent).expect("map");
    let entries = map.range_entries();
    assert_eq!(
        engine.locate(parent, &Value::Integer(100)).expect("locate"),
        Located::One(entries[1].partition_id)
    );
    assert_eq!(
        engine.locate(parent, &Value::Integer(0)).expect("locate"),
        Located::One(entries[0].partition_id)
    );
    // A value at an existing upper edge appends exactly one partition.
    engine
        .obtain_partition(&session, parent, &Value::Integer(200))
        .expect("spawn");
    assert_eq!(engine.partition_map(parent).expect("map").partition_count(), 3);
}

#[test]
fn open_ended_maps_cannot_be_extended() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(
        &engine,
        &session,
        vec![
            (Bound::NegativeInfinity, fin(0)),
            (fin(0), Bound::PositiveInfinity),
        ],
        10,
    );
    // Covered already; nothing to create.
    let id = engine
        .obtain_partition(&session, parent, &Value::Integer(5))
        .expect("covered");
    assert_eq!(
        engine.locate(parent, &Value::Integer(5)).expect("locate"),
        Located::One(id)
    );

    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(
        &engine,
        &session,
        vec![
            (Bound::NegativeInfinity, fin(0)),
            (fin(10), Bound::PositiveInfinity),
        ],
        10,
    );
    let err = engine
        .obtain_partition(&session, parent, &Value::Integer(5))
        .expect_err("both ends open");
    assert_eq!(err.code(), AutopartErrorCode::UnboundedExtension);
    assert!(err.is_metadata_corruption());
    assert!(!err.is_retriable());
}

#[test]
fn gaps_inside_the_covered_range_are_not_filled() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(
        &engine,
        &session,
        vec![(fin(0), fin(10)), (fin(20), fin(30))],
        10,
    );
    let err = engine
        .obtain_partition(&session, parent, &Value::Integer(15))
        .expect_err("gap");
    assert_eq!(err.code(), AutopartErrorCode::CoverageGap);
    assert_eq!(engine.partition_map(parent).expect("map").partition_count(), 2);
}

#[test]
fn over_cap_spawn_creates_nothing() {
    let (engine, session) = engine_with(AutopartConfig {
        max_spawn_steps: 5,
        ..AutopartConfig::development()
    });
    let parent = range_table(&engine, &session, vec![(fin(0), fin(10))], 10);
    let err = engine
        .obtain_partition(&session, parent, &Value::Integer(i64::MAX))
        .expect_err("far key");
    assert_eq!(err.code(), AutopartErrorCode::SpawnLimitExceeded);
    assert_eq!(engine.partitions(parent).len(), 1);

    // Exactly at the cap still works.
    engine
        .obtain_partition(&session, parent, &Value::Integer(59))
        .expect("five steps");
    assert_eq!(engine.partitions(parent).len(), 6);
}

#[test]
fn nan_keys_are_rejected_without_spawning() {
    let (engine, session) = engine_with(AutopartConfig {
        max_spawn_steps: 50,
        ..AutopartConfig::development()
    });
    let parent = engine
        .create_table(
            DEFAULT_SCHEMA,
            "readings",
            vec![ColumnDef::new("v", ColumnType::Float)],
            None,
        )
        .expect("table");
    engine
        .create_range_partitioning(
            &session,
            parent,
            RangePartitioning::new("v", Some(Value::Float(10.0))).with_bounds(vec![(
                Bound::Finite(Value::Float(0.0)),
                Bound::Finite(Value::Float(10.0)),
            )]),
        )
        .expect("partitioning");
    engine.commit_session(&session).expect("commit");

    let err = engine
        .obtain_partition(&session, parent, &Value::Float(f64::NAN))
        .expect_err("nan");
    assert_eq!(err.code(), AutopartErrorCode::Validation);
    assert_eq!(engine.partitions(parent).len(), 1);
}

#[test]
fn monthly_date_partitions_widen_to_timestamps_once() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = engine
        .create_table(
            DEFAULT_SCHEMA,
            "logs",
            vec![ColumnDef::new("day", ColumnType::Date)],
            None,
        )
        .expect("table");
    let jan = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
    let feb = NaiveDate::from_ymd_opt(2024, 2, 1).expect("date");
    engine
        .create_range_partitioning(
            &session,
            parent,
            RangePartitioning::new("day", Some(Value::Interval(Interval::months(1))))
                .with_bounds(vec![(
                    Bound::Finite(Value::Date(jan)),
                    Bound::Finite(Value::Date(feb)),
                )]),
        )
        .expect("partitioning");
    engine.commit_session(&session).expect("commit");

    let mid_march = Value::Date(NaiveDate::from_ymd_opt(2024, 3, 15).expect("date"));
    let id = engine
        .obtain_partition(&session, parent, &mid_march)
        .expect("spawn");
    let map = engine.partition_map(parent).expect("map");
    assert_eq!(map.partition_count(), 3);
    map.check_invariants().expect("sorted, no overlap");
    assert!(map.is_contiguous().expect("contiguous"));
    let last = &map.range_entries()[2];
    assert_eq!(last.partition_id, id);
    let Bound::Finite(Value::Timestamp(lower)) = &last.lower else {
        panic!("expected a timestamp bound, got {:?}", last.lower);
    };
    assert_eq!(lower.date(), NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"));
}

#[test]
fn manual_partitions_reject_overlap() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(&engine, &session, vec![(fin(0), fin(100))], 100);
    let err = engine
        .add_range_partition(&session, parent, &fin(50), &fin(150), None, None)
        .expect_err("overlap");
    assert_eq!(err.code(), AutopartErrorCode::RangeOverlap);

    let id = engine
        .add_range_partition(&session, parent, &fin(100), &fin(150), Some("events_manual"), Some("cold"))
        .expect("adjacent");
    let schema = engine.table(id).expect("schema");
    assert_eq!(schema.table_name, "events_manual");
    assert_eq!(schema.tablespace.as_deref(), Some("cold"));

    let err = engine
        .add_range_partition(&session, parent, &fin(300), &fin(200), None, None)
        .expect_err("inverted");
    assert_eq!(err.code(), AutopartErrorCode::Validation);

    let err = engine
        .add_range_partition(
            &session,
            parent,
            &Bound::NegativeInfinity,
            &Bound::PositiveInfinity,
            None,
            None,
        )
        .expect_err("unbounded");
    assert_eq!(err.code(), AutopartErrorCode::RangeOverlap);
}

#[test]
fn spawned_partitions_inherit_the_parent_tablespace() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = engine
        .create_table(
            DEFAULT_SCHEMA,
            "events",
            vec![ColumnDef::new("k", ColumnType::Integer)],
            Some("fast_ssd"),
        )
        .expect("table");
    engine
        .create_range_partitioning(
            &session,
            parent,
            RangePartitioning::new("k", Some(Value::Integer(10)))
                .with_count(Value::Integer(0), 1),
        )
        .expect("partitioning");
    let id = engine
        .obtain_partition(&session, parent, &Value::Integer(15))
        .expect("spawn");
    assert_eq!(
        engine.table(id).expect("schema").tablespace.as_deref(),
        Some("fast_ssd")
    );
}

#[test]
fn name_generation_gives_up_after_the_attempt_cap() {
    let (engine, session) = engine_with(AutopartConfig {
        max_name_attempts: 2,
        ..AutopartConfig::development()
    });
    let parent = range_table(&engine, &session, vec![], 10);
    for squatter in ["events_1", "events_2"] {
        engine
            .create_table(
                DEFAULT_SCHEMA,
                squatter,
                vec![ColumnDef::new("k", ColumnType::Integer)],
                None,
            )
            .expect("squatter");
    }
    let err = engine
        .add_range_partition(&session, parent, &fin(0), &fin(10), None, None)
        .expect_err("exhausted");
    assert_eq!(err.code(), AutopartErrorCode::NameExhausted);
    assert!(engine.partitions(parent).is_empty());
}

#[test]
fn disabled_auto_creation_reports_no_partition() {
    let (engine, session) = engine_with(AutopartConfig {
        auto_partition_enabled: false,
        ..AutopartConfig::development()
    });
    let parent = range_table(&engine, &session, vec![(fin(0), fin(10))], 10);
    let err = engine
        .obtain_partition(&session, parent, &Value::Integer(50))
        .expect_err("globally disabled");
    assert_eq!(err.code(), AutopartErrorCode::NoSuitablePartition);

    let (engine, session) = engine_with(AutopartConfig::development());
    let parent = range_table(&engine, &session, vec![(fin(0), fin(10))], 10);
    engine
        .set_partition_params(
            parent,
            PartitionParamsUpdate {
                auto_create: Some(false),
                ..PartitionParamsUpdate::default()
            },
        )
        .expect("params");
    let err = engine
        .obtain_partition(&session, parent, &Value::Integer(50))
        .expect_err("disabled for the table");
    assert_eq!(err.code(), AutopartErrorCode::NoSuitablePartition);
}

#[test]
fn init_callback_sees_every_new_partition() {
    let (engine, session) = engine_with(AutopartConfig::development());
    let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .register_callback("record", move |payload| {
            sink.lock().map_err(|e| e.to_string())?.push(payload.clone());
            Ok(())
        })
        .expect("register");
    let parent = range_table(&engine, &session, vec![(fin(0), fin(100))], 50);
    engine
        .set_partition_params(
            parent,
            PartitionParamsUpdate {
                init_callback: Some(Some("record".into())),
                ..PartitionParamsUpdate::default()
            },
        )
        .expect("params");

    engine
        .obtain_partition(&session, parent, &Value::Integer(150))
        .expect("spawn");
    let seen = seen.lock().expect("payloads");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["parent"], "events");
    assert_eq!(seen[0]["parent_schema"], "public");
    assert_eq!(seen[0]["parttype"], "range");
    assert_eq!(seen[0]["range_min"], "100");
    assert_eq!(seen[0]["range_max"], "150");
    assert_eq!(seen[1]["range_min"], "150");
    assert_eq!(seen[1]["range_max"], "200");
}

#[test]
fn failing_callback_fails_creation_but_keeps_the_partition() {
    let (engine, session) = engine_with(AutopartConfig::development());
    engine
        .register_callback("reject", |_| Err("not today".to_string()))
        .expect("register");
    let parent = engine
        .create_table(
            DEFAULT_SCHEMA,
            "events",
            vec![ColumnDef::new("k", ColumnType::Integer)],
            None,
        )
        .expect("table");
    engine
        .create_range_partitioning(
            &session,
            parent,
            RangePartitioning::new("k", Some(Value::Integer(10)))
                .with_count(Value::Integer(0), 1),
        )
        .expect("partitioning");
    engine
        .set_partition_params(
            parent,
            PartitionParamsUpdate {
                init_callback: Some(Some("reject".into())),
                ..PartitionParamsUpdate::default()
            },
        )
        .expect("params");

    let err = engine
        .obtain_partition(&session, parent, &Value::Integer(35))
        .expect_err("callback fails");
    assert_eq!(err.code(), AutopartErrorCode::CallbackError);
    assert!(err.to_string().contains("not today"));
    assert_eq!(engine.partitions(parent).len(), 2);
}

#[test]
fn callbacks_with_the_wrong_signature_are_refused() {
    let (engine, _session) = engine_with(AutopartConfig::development());
    engine
        .register_procedure(
            "wrong",
            autopart::partition::callback::CallbackSignature {
                args: vec![ColumnType::Text],
                returns: None,
            },
            |_| Ok(()),
        )
        .expect("register");
    let parent = engine
        .create_table(
            DEFAULT_SCHEMA,
            "events",
            vec![ColumnDef::new("k", ColumnType::Integer)],
            None,
        )
        .expect("table");
    let err = engine
        .create_range_partitioning(
            &engine.session(),
            parent,
            RangePartitioning::new("k", Some(Value::Integer(10))).with_params(PartitionParams {
                init_callback: Some("wrong".into()),
                ..PartitionParams::default()
            }),
        )
        .expect_err("signature");
    assert_eq!(err.code(), AutopartErrorCode::CallbackError);
}
