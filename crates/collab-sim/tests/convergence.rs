//! End-to-end convergence runs of the simulator.

use collab_sim::{SimConfig, Simulator};

#[test]
fn test_two_peers_converge() {
    let config = SimConfig {
        peers: 2,
        rounds: 10,
        seed: 1,
        ..SimConfig::default()
    };
    let report = Simulator::new(config).expect("Failed to start").run().expect("Peers diverged");

    assert_eq!(report.edits, 2 * 10 * 3);
    assert!(report.messages > 0);
    assert!(report.nodes > 1);
}

#[test]
fn test_many_seeds_converge() {
    for seed in 0..8 {
        let config = SimConfig {
            peers: 3,
            rounds: 12,
            seed,
            ..SimConfig::default()
        };
        let sim = Simulator::new(config).expect("Failed to start");
        if let Err(e) = sim.run() {
            panic!("seed {} diverged: {:#}", seed, e);
        }
    }
}
