use super::*;

fn instances(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn test_round_robin_spreads_shards() {
    let mut scheduler = RoundRobinScheduler::new();
    let placement = scheduler
        .place(&[0, 1, 2, 3, 4], &instances(&["w1", "w2"]))
        .unwrap();
    assert_eq!(
        placement,
        vec![
            ("w1".to_string(), vec![0, 2, 4]),
            ("w2".to_string(), vec![1, 3]),
        ]
    );
}

#[test]
fn test_cursor_carries_over() {
    let mut scheduler = RoundRobinScheduler::new();
    let names = instances(&["w1", "w2", "w3"]);
    scheduler.place(&[0], &names).unwrap();
    let placement = scheduler.place(&[7], &names).unwrap();
    assert_eq!(placement, vec![("w2".to_string(), vec![7])]);
}

#[test]
fn test_fewer_shards_than_instances() {
    let mut scheduler = RoundRobinScheduler::new();
    let placement = scheduler
        .place(&[5, 6], &instances(&["w1", "w2", "w3"]))
        .unwrap();
    assert_eq!(placement.len(), 2);
}

#[test]
fn test_no_instances_is_an_error() {
    let mut scheduler = RoundRobinScheduler::new();
    assert!(scheduler.place(&[0], &[]).is_err());
    assert!(scheduler.place(&[], &[]).unwrap().is_empty());
}
