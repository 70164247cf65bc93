//! Integration tests for the block rotation engine
//!
//! Uses the fixed scenario geometry: BLOCK_SIZE = 1000 ms, 3 history
//! blocks + 1 bumper slot, clock pinned at 10050 unless a test moves it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minitsdb::backend::{AttrValue, Database, DatabaseRef, MemoryDatabase, QueryOptions};
use minitsdb::error::TsdbError;
use minitsdb::store::{BlockState, Clock, ManualClock, Schema, StoreConfig};

fn test_config() -> StoreConfig {
    StoreConfig {
        store_history: 3000,
        store_history_blocks: 3,
        writer_flush_ms: 25,
        ..Default::default()
    }
}

struct TestEnv {
    db: Arc<MemoryDatabase>,
    clock: Arc<ManualClock>,
    schema: Schema,
}

fn setup(now: u64) -> TestEnv {
    setup_with(now, test_config(), Duration::ZERO)
}

fn setup_with(now: u64, config: StoreConfig, activation_delay: Duration) -> TestEnv {
    let db = Arc::new(MemoryDatabase::with_activation_delay(activation_delay));
    let db_ref: DatabaseRef = db.clone();
    let config = Arc::new(config);
    let clock = Arc::new(ManualClock::new(now));
    let clock_ref: Arc<dyn Clock> = clock.clone();
    Schema::create(&db_ref, &config, &clock_ref, Duration::from_secs(10)).unwrap();
    let schema = Schema::open(db_ref, config, clock_ref).unwrap();
    TestEnv { db, clock, schema }
}

fn tags(pairs: &[(&str, &str)]) -> minitsdb::types::Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Let the batched writer's idle flush run
fn settle() {
    thread::sleep(Duration::from_millis(150));
}

#[test]
fn test_store_routes_to_block_tables() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    assert_eq!(block.n(), 2);
    assert_eq!(block.tbase(), 10000);

    env.schema
        .store_datapoint(10050, "m", &tags(&[("h", "a")]), 1.5, "d")
        .unwrap();
    settle();

    let rows = env
        .db
        .query(
            "amdw_dp_10000",
            &AttrValue::text("d|m|0000000010000|h=a"),
            None,
            &QueryOptions::default(),
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["toffset"].as_u64(), Some(50));
    assert_eq!(rows[0]["value"].as_f64(), Some(1.5));
    assert_eq!(env.db.row_count("amdw_dp_index_10000"), 1);
}

#[test]
fn test_duplicate_writes_hit_dedup_cache() {
    let env = setup(10050);
    env.schema.create_current().unwrap().create_tables().unwrap();

    for _ in 0..2 {
        env.schema
            .store_datapoint(10050, "m", &tags(&[("h", "a")]), 1.5, "d")
            .unwrap();
    }
    settle();

    // second write skipped the index put entirely
    assert_eq!(env.db.write_count("amdw_dp_index_10000"), 1);
    assert_eq!(env.schema.index_key_cache().len(), 1);
    assert_eq!(env.db.row_count("amdw_dp_index_10000"), 1);
    // the datapoint write is an overwrite of the same (hash, toffset)
    assert_eq!(env.db.row_count("amdw_dp_10000"), 1);
}

#[test]
fn test_out_of_window_write_drops_silently() {
    let env = setup(10050);
    env.schema.create_current().unwrap().create_tables().unwrap();

    assert!(env.schema.get_block(0).is_none());
    env.schema
        .store_datapoint(0, "m", &tags(&[]), 1.0, "d")
        .unwrap();
    settle();
    assert_eq!(env.db.row_count("amdw_dp_10000"), 0);
    assert!(env.db.describe_table("amdw_dp_0").is_err());
}

#[test]
fn test_write_to_initial_block_drops_silently() {
    let env = setup(10050);
    // slot exists (tbase matches) but no tables were created yet
    let block = env.schema.get_block(10050).unwrap();
    assert_eq!(block.state().unwrap(), BlockState::Initial);
    env.schema
        .store_datapoint(10050, "m", &tags(&[]), 1.0, "d")
        .unwrap();
    assert!(env.db.describe_table("amdw_dp_10000").is_err());
}

#[test]
fn test_replace_same_tbase_is_noop() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    let record = block.record();

    // 10500 lives in the same block
    block.replace(10500).unwrap();
    assert_eq!(block.tbase(), record.tbase);
    assert!(env.db.describe_table("amdw_dp_10000").is_ok());
}

#[test]
fn test_replace_wrong_slot_is_programmer_error() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    // 11050 maps to slot 3, not this block's slot 2
    match block.replace(11050) {
        Err(TsdbError::Block(msg)) => assert!(msg.contains("not valid for block")),
        other => panic!("expected a block error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_recycle_deletes_tables_and_reseeds_master() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    env.schema
        .store_datapoint(10050, "m", &tags(&[("h", "a")]), 1.5, "d")
        .unwrap();

    // one ring period later the same slot hosts tbase 14000
    env.clock.set(14050);
    let replaced = env.schema.create_current().unwrap();
    assert_eq!(replaced.n(), 2);
    assert_eq!(replaced.tbase(), 14000);
    assert_eq!(replaced.state().unwrap(), BlockState::Initial);
    assert!(matches!(
        env.db.describe_table("amdw_dp_10000"),
        Err(TsdbError::TableNotFound(_))
    ));
    assert!(matches!(
        env.db.describe_table("amdw_dp_index_10000"),
        Err(TsdbError::TableNotFound(_))
    ));

    // the master table still holds exactly one record for the slot
    let records = env
        .db
        .query(
            "amdw_dp_master",
            &AttrValue::from(2u64),
            None,
            &QueryOptions::consistent(),
        )
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["tbase"].as_u64(), Some(14000));
    assert_eq!(records[0]["state"].as_str(), Some("INITIAL"));
}

#[test]
fn test_wait_for_active_persists_transition() {
    let env = setup_with(10050, test_config(), Duration::from_millis(60));
    let block = env.schema.create_current().unwrap();
    let state = block.create_tables().unwrap();
    assert_eq!(state, BlockState::Creating);

    let state = block
        .wait_for_active(Duration::from_secs(2), Duration::from_millis(10))
        .unwrap();
    assert_eq!(state, BlockState::Active);
    assert_eq!(block.record().state, BlockState::Active);
}

#[test]
fn test_wait_for_active_gives_up_at_deadline() {
    let env = setup_with(10050, test_config(), Duration::from_millis(300));
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    let state = block
        .wait_for_active(Duration::from_millis(50), Duration::from_millis(10))
        .unwrap();
    assert_eq!(state, BlockState::Creating);
}

#[test]
fn test_turndown_flushes_writer_and_drops_capacity() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    env.schema
        .store_datapoint(10050, "m", &tags(&[("h", "a")]), 1.5, "d")
        .unwrap();
    assert!(block.has_writer());

    block.turndown_tables().unwrap();

    // the buffered point was flushed synchronously, no idle wait needed
    assert_eq!(env.db.row_count("amdw_dp_10000"), 1);
    assert!(!block.has_writer());
    assert_eq!(block.state().unwrap(), BlockState::TurnedDown);
    assert_eq!(env.db.describe_table("amdw_dp_10000").unwrap().throughput.write, 1);
    assert_eq!(
        env.db
            .describe_table("amdw_dp_index_10000")
            .unwrap()
            .throughput
            .write,
        1
    );

    // writes after turndown are silent drops
    env.schema
        .store_datapoint(10060, "m", &tags(&[("h", "a")]), 2.5, "d")
        .unwrap();
    settle();
    assert_eq!(env.db.row_count("amdw_dp_10000"), 1);
}

#[test]
fn test_disagreeing_tables_report_undefined() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    assert_eq!(block.state().unwrap(), BlockState::Active);

    // knock one table's write capacity down behind the block's back
    env.db
        .update_throughput("amdw_dp_10000", minitsdb::backend::Throughput::new(5, 1))
        .unwrap();
    assert_eq!(block.state().unwrap(), BlockState::Undefined);
}

#[test]
fn test_schema_open_seeds_ring_slots() {
    let env = setup(10050);
    // slots cover now .. now + 3 blocks
    let mut tbases: Vec<u64> = env.schema.blocks().iter().map(|b| b.tbase()).collect();
    tbases.sort();
    assert_eq!(tbases, vec![10000, 11000, 12000, 13000]);
    for block in env.schema.blocks() {
        assert_eq!(block.record().state, BlockState::Initial);
    }
}

#[test]
fn test_refresh_picks_up_external_mutation() {
    let db = Arc::new(MemoryDatabase::new());
    let db_ref: DatabaseRef = db.clone();
    let config = Arc::new(test_config());
    let clock = Arc::new(ManualClock::new(10050));
    let clock_ref: Arc<dyn Clock> = clock.clone();
    Schema::create(&db_ref, &config, &clock_ref, Duration::from_secs(10)).unwrap();

    let schema_a = Schema::open(db_ref.clone(), config.clone(), clock_ref.clone()).unwrap();
    let schema_b = Schema::open(db_ref, config, clock_ref).unwrap();

    // a creates the current block's tables; b still holds the stale record
    schema_a.create_current().unwrap().create_tables().unwrap();
    let block_b = schema_b.get_block(10050).unwrap();
    assert_eq!(block_b.record().state, BlockState::Initial);
    assert!(!block_b.has_writer());

    let state = block_b.refresh().unwrap();
    assert_eq!(state, BlockState::Active);
    assert!(block_b.has_writer());
    assert_eq!(
        block_b.record().data_points_name.as_deref(),
        Some("amdw_dp_10000")
    );
}

#[test]
fn test_create_tables_is_idempotent() {
    let env = setup(10050);
    let block = env.schema.create_current().unwrap();
    block.create_tables().unwrap();
    env.schema
        .store_datapoint(10050, "m", &tags(&[]), 1.0, "d")
        .unwrap();
    // calling again must not disturb existing tables or the writer
    let state = block.create_tables().unwrap();
    assert_eq!(state, BlockState::Active);
    settle();
    assert_eq!(env.db.row_count("amdw_dp_10000"), 1);
}

#[test]
fn test_destroy_removes_everything() {
    let db = Arc::new(MemoryDatabase::new());
    let db_ref: DatabaseRef = db.clone();
    let config = Arc::new(test_config());
    let clock = Arc::new(ManualClock::new(10050));
    let clock_ref: Arc<dyn Clock> = clock.clone();
    Schema::create(&db_ref, &config, &clock_ref, Duration::from_secs(10)).unwrap();
    {
        let schema = Schema::open(db_ref.clone(), config.clone(), clock_ref.clone()).unwrap();
        schema.create_current().unwrap().create_tables().unwrap();
    }

    Schema::destroy(db_ref, config, clock_ref).unwrap();
    assert!(db.table_names().is_empty());
}
