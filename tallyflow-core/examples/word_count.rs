//! Count the words of a few sentences on 3 replicas and print what every
//! destination received.
use tallyflow::config::StageConfig;
use tallyflow::flush::{decode_snapshot, SnapshotMessage};
use tallyflow::messaging::{EgressDestination, MemoryBroker};
use tallyflow::runtime::Job;

const SENTENCES: [&str; 3] = [
    "the quick brown fox",
    "jumps over the lazy dog",
    "the dog sleeps",
];

fn main() {
    tracing_subscriber::fmt::init();

    let destinations: Vec<EgressDestination> = vec!["counts".into(), "audit".into()];
    let config = StageConfig::builder()
        .replica_count(3)
        .batch_size(4)
        .egress_destinations(destinations.clone())
        .build();
    let broker = MemoryBroker::new();

    // tokenizing is a plain stateless transform in front of the stage
    let words = SENTENCES
        .iter()
        .flat_map(|s| s.split_whitespace())
        .map(str::to_lowercase);

    let report = Job::new(config, broker.clone(), |w: &String| Some(w.clone()))
        .execute(words)
        .unwrap();
    println!("merged: {:?}", report.merged_counts());

    for dest in destinations.iter() {
        for msg in broker.committed(dest) {
            let snapshot: SnapshotMessage<String, u64> = decode_snapshot(&msg.payload).unwrap();
            println!("{dest} <- replica {}: {:?}", snapshot.replica, snapshot.counts);
        }
    }
}
