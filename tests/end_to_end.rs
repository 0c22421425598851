// tests/end_to_end.rs
use cn_miner_rs::miner::backend::BackendOptions;
use cn_miner_rs::miner::CoordinatorOptions;
use cn_miner_rs::*;
use std::sync::Arc;
use std::time::Duration;

fn header_blob() -> Vec<u8> {
    // major 7, minor 7, timestamp varint, then prev hash, nonce and tail
    let mut blob = vec![0x07, 0x07, 0xb5, 0xa2, 0xe0, 0xd8, 0x05];
    blob.resize(76, 0x3c);
    blob
}

#[test]
fn real_engine_results_are_accepted_and_verifiable() {
    let pool = Arc::new(LoopbackPool::new());
    let job = Job::new("e2e", header_blob(), u64::MAX / 2, None, false).unwrap();
    pool.set_initial_job("solo", job.clone());

    let small = BackendOptions {
        nonce_block: 2,
        max_threads: 1,
        idle_wait: Duration::from_millis(10),
    };
    let options = CoordinatorOptions {
        cpu_limit: 1.0,
        batch_limit: 0.0,
        cpu: small.clone(),
        batch: small,
        ..CoordinatorOptions::default()
    };
    let worker = Worker::new("solo", "127.0.0.1", 3333, "wallet");
    let coordinator = MiningCoordinator::new(vec![worker], Arc::new(CryptoNight), pool.clone(), options);
    let events = coordinator.events();
    coordinator.start_mining().unwrap();

    let accepted = loop {
        match events.recv_timeout(Duration::from_secs(120)) {
            Ok(MinerEvent::AcceptedResult { worker_id, .. }) => break worker_id,
            Ok(_) => continue,
            Err(e) => panic!("no accepted result: {}", e),
        }
    };
    coordinator.stop_mining();
    assert_eq!(accepted, "solo");
    assert_eq!(coordinator.state(), SessionState::Idle);

    let submissions = pool.submissions();
    assert!(!submissions.is_empty());
    let engine = CryptoNight;
    let mut scratch = Scratchpad::new().unwrap();
    for submission in submissions {
        assert_eq!(submission.job_id, "e2e");
        let mut blob = job.blob.clone();
        job.write_nonce(&mut blob, submission.nonce);
        let hash = engine.hash(&blob, job.version, &mut scratch).unwrap();
        assert_eq!(hash, submission.hash);
        assert!(hash.meets_target(job.target));
    }
    assert!(coordinator.stats().shares_accepted >= 1);
}
