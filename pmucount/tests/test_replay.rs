use pmucount::domain::Mode;
use pmucount::replay::{replay, replay_file, Trace};

fn trace(json: &str) -> Trace {
    Trace::from_json(json).expect("valid trace")
}

#[test]
fn test_two_cpu_deltas_sum_to_170() {
    let trace = trace(
        r#"{
        "mode": "cgroup",
        "num_cpus": 2,
        "events": ["cycles"],
        "cgroups": [{"id": 1, "name": "root"}, {"id": 2, "parent": 1, "name": "web"}],
        "register": [2],
        "records": [
            {"kind": "switch", "cpu": 0, "cgroup": 2, "readings": [100]},
            {"kind": "switch", "cpu": 1, "cgroup": 2, "readings": [50]},
            {"kind": "switch", "cpu": 0, "cgroup": 2, "readings": [150]},
            {"kind": "switch", "cpu": 1, "cgroup": 2, "readings": [50]},
            {"kind": "switch", "cpu": 0, "cgroup": 2, "readings": [230]},
            {"kind": "switch", "cpu": 1, "cgroup": 2, "readings": [90]}
        ]
    }"#,
    );

    let report = replay(&trace).unwrap();
    assert_eq!(report.mode, Mode::Cgroup);
    assert_eq!(report.total("web", "cycles"), Some(170));

    let per_cpu: Vec<(Option<u32>, u64)> =
        report.samples.iter().map(|s| (s.cpu, s.count)).collect();
    assert_eq!(per_cpu, vec![(Some(0), 130), (Some(1), 40)]);
}

#[test]
fn test_fork_chain_accumulates_into_root_key() {
    // A (10) forks B (11) forks C (12); 99 is never tracked
    let trace = trace(
        r#"{
        "mode": "process",
        "num_cpus": 1,
        "events": ["instructions"],
        "track": [10],
        "records": [
            {"kind": "switch", "cpu": 0, "tid": 10, "readings": [0]},
            {"kind": "switch", "cpu": 0, "tid": 10, "readings": [5]},
            {"kind": "fork", "parent": 10, "child": 11},
            {"kind": "switch", "cpu": 0, "tid": 11, "readings": [12]},
            {"kind": "fork", "parent": 11, "child": 12},
            {"kind": "switch", "cpu": 0, "tid": 12, "readings": [20]},
            {"kind": "fork", "parent": 99, "child": 100},
            {"kind": "switch", "cpu": 0, "tid": 99, "readings": [50]},
            {"kind": "switch", "cpu": 0, "tid": 100, "readings": [60]},
            {"kind": "switch", "cpu": 0, "tid": 10, "readings": [61]}
        ]
    }"#,
    );

    let report = replay(&trace).unwrap();
    assert_eq!(report.total("10", "instructions"), Some(5 + 7 + 8 + 1));
    assert_eq!(report.totals().len(), 1);
    assert!(report.diagnostics.is_empty());
}

#[test]
fn test_nested_registration_counts_leaf_and_root() {
    // root → g1 → g2, only root and g2 registered
    let trace = trace(
        r#"{
        "mode": "cgroup",
        "num_cpus": 1,
        "events": ["cycles"],
        "cgroups": [
            {"id": 1, "name": "root"},
            {"id": 2, "parent": 1, "name": "g1"},
            {"id": 3, "parent": 2, "name": "g2"}
        ],
        "register": [3, 1],
        "records": [
            {"kind": "switch", "cpu": 0, "cgroup": 3, "readings": [1000]},
            {"kind": "switch", "cpu": 0, "cgroup": 3, "readings": [1100]},
            {"kind": "switch", "cpu": 0, "cgroup": 2, "readings": [1120]}
        ]
    }"#,
    );

    let report = replay(&trace).unwrap();
    let totals = report.totals();
    assert_eq!(totals[0].group, "g2");
    assert_eq!(totals[0].count, 100);
    assert_eq!(totals[1].group, "root");
    assert_eq!(totals[1].count, 120);
}

#[test]
fn test_failed_reads_skip_one_switch() {
    let trace = trace(
        r#"{
        "mode": "process",
        "num_cpus": 1,
        "events": ["cycles", "instructions"],
        "track": [7],
        "records": [
            {"kind": "switch", "cpu": 0, "tid": 7, "readings": [10, 100]},
            {"kind": "switch", "cpu": 0, "tid": 7, "readings": [null, 150]},
            {"kind": "switch", "cpu": 0, "tid": 7, "readings": [30, 160]}
        ]
    }"#,
    );

    let report = replay(&trace).unwrap();
    // the skipped read leaves the snapshot alone, so nothing is lost
    assert_eq!(report.total("7", "cycles"), Some(20));
    assert_eq!(report.total("7", "instructions"), Some(60));
    assert_eq!(report.diagnostics.get("read_failed"), Some(&1));
}

#[test]
fn test_many_cpus_replay_concurrently() {
    let num_cpus = 8u32;
    let mut records = Vec::new();
    for step in 0..=200u64 {
        for cpu in 0..num_cpus {
            records.push(format!(
                r#"{{"kind": "switch", "cpu": {cpu}, "tid": 1, "readings": [{}]}}"#,
                step * 2
            ));
        }
    }
    let json = format!(
        r#"{{"mode": "process", "num_cpus": {num_cpus}, "events": ["cycles"], "track": [1],
            "records": [{}]}}"#,
        records.join(",")
    );

    let report = replay(&trace(&json)).unwrap();
    assert_eq!(report.total("1", "cycles"), Some(u64::from(num_cpus) * 400));
}

#[test]
fn test_replay_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.json");
    std::fs::write(
        &path,
        r#"{"mode": "cgroup", "num_cpus": 1, "events": ["cycles"],
            "cgroups": [{"id": 4}], "register": [4],
            "records": [
                {"kind": "switch", "cpu": 0, "cgroup": 4, "readings": [1]},
                {"kind": "switch", "cpu": 0, "cgroup": 4, "readings": [3]}
            ]}"#,
    )
    .unwrap();

    let report = replay_file(&path).unwrap();
    assert_eq!(report.total("cgroup#4", "cycles"), Some(2));
    assert!(replay_file(&dir.path().join("missing.json")).is_err());
}
