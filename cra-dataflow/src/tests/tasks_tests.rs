use super::*;

fn entry(kind: TransformKind, function: &str, input: &str, output: &str) -> TransformEntry {
    TransformEntry::new(kind, function, "", OperatorInputs::unary(input), output)
}

#[test]
fn test_task_bytes_roundtrip() {
    let split = entry(TransformKind::MoveSplit, "builtin::split-by-key", "produce-0", "move-1/split");
    let merge = entry(TransformKind::MoveMerge, "builtin::merge-concat", "move-1/split", "move-1");
    let mut task = TaskBase::shuffle("move-1", "produce-0", split, merge);
    task.transforms
        .push(entry(TransformKind::UnaryTransform, "shift", "move-1", "transform-2"));
    task.connections.insert(
        "move-1".to_string(),
        vec![OperatorConnection {
            from_vertex: "produce-0".to_string(),
            from_endpoint: output_endpoint("move-1"),
            to_vertex: "move-1".to_string(),
            to_endpoint: input_endpoint("produce-0"),
            pattern: ConnectionPattern::AllToAll,
            secondary: false,
            locality: ConnectionLocality::Network,
        }],
    );

    let restored = TaskBase::from_bytes(&task.to_bytes().unwrap()).unwrap();
    assert_eq!(restored, task);
    assert_eq!(restored.incoming().count(), 1);
    assert_eq!(restored.outgoing().count(), 0);
}

#[test]
fn test_shuffle_accessors() {
    let split = entry(TransformKind::MoveSplit, "split", "a", "m/split");
    let merge = entry(TransformKind::MoveMerge, "merge", "m/split", "m");
    let task = TaskBase::shuffle("m", "a", split.clone(), merge.clone());
    let shuffle = task.shuffle_task().unwrap();
    assert_eq!(shuffle.split(), &split);
    assert_eq!(shuffle.merge(), &merge);
    assert_eq!(shuffle.mapper_vertex_name, "m");
    assert_eq!(shuffle.reducer_vertex_name, "m");
    assert_eq!(task.input_ids, OperatorInputs::unary("a"));
}

#[test]
fn test_transforms_ends_with_split() {
    let mut transforms = OperatorTransforms::new();
    assert!(!transforms.ends_with_split());
    transforms.push(entry(TransformKind::UnaryTransform, "f", "p", "t"));
    assert!(!transforms.ends_with_split());
    transforms.push(entry(TransformKind::MoveSplit, "s", "t", "m/split"));
    assert!(transforms.ends_with_split());
    assert!(transforms.contains_output("t"));
}

#[test]
fn test_endpoint_names() {
    assert_eq!(output_endpoint("move-2"), "to:move-2");
    assert_eq!(input_endpoint("produce-0"), "from:produce-0");
    assert_eq!(secondary_input_endpoint("move-3"), "secondary:move-3");
    assert_eq!(nth_endpoint(input_endpoint("a"), 0), "from:a");
    assert_eq!(nth_endpoint(input_endpoint("a"), 2), "from:a#2");
}
