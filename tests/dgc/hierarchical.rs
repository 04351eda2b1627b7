use super::helpers::{assert_close, hierarchical_configs, run_ranks, upload};
use nexar_dgc::{DataType, DgcState, Layer, gradient_all_reduce};

fn run_on_hosts(hosts: &[&str], hierarchical: bool) -> Vec<Vec<f32>> {
    run_with(hosts, hierarchical, true)
}

fn run_with(hosts: &[&str], hierarchical: bool, masked: bool) -> Vec<Vec<f32>> {
    let configs = hierarchical_configs(hosts, |c| {
        c.use_hierarchical_allreduce = hierarchical;
        c.use_masked_allreduce = masked;
    });
    run_ranks(configs, |rank, config| {
        let layers = [Layer::new("w", 4), Layer::new("b", 2)];
        let grads: Vec<f32> = [1.0f32, -3.0, 0.5, 0.0, 2.0, 6.0]
            .iter()
            .map(|v| v * (rank + 1) as f32)
            .collect();
        let buf = upload(&config, "grads", &grads);
        let mut state = DgcState::new();
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, &config, &mut state).unwrap();
        config.stream().unwrap().synchronize().unwrap();
        buf.to_vec::<f32>().unwrap()
    })
}

#[test]
fn test_two_nodes_average() {
    let results = run_on_hosts(&["node-a", "node-a", "node-b", "node-b"], true);
    // Mean of factors 1..=4 is 2.5.
    let expected = vec![2.5f32, -7.5, 1.25, 0.0, 5.0, 15.0];
    for out in results {
        assert_eq!(out, expected);
    }
}

#[test]
fn test_two_nodes_average_over_full_buffer() {
    let results = run_with(&["node-a", "node-a", "node-b", "node-b"], true, false);
    let expected = vec![2.5f32, -7.5, 1.25, 0.0, 5.0, 15.0];
    for out in results {
        assert_eq!(out, expected);
    }
}

#[test]
fn test_interleaved_hosts_average() {
    let results = run_on_hosts(&["node-a", "node-b", "node-a"], true);
    // Mean of factors 1..=3 is 2; thirds do not divide exactly.
    let expected = [2.0f32, -6.0, 1.0, 0.0, 4.0, 12.0];
    for out in results {
        assert_close(&out, &expected, 1e-5);
    }
}

#[test]
fn test_flat_reduce_on_many_nodes() {
    let results = run_on_hosts(&["a", "b", "c", "d"], false);
    let expected = vec![2.5f32, -7.5, 1.25, 0.0, 5.0, 15.0];
    for out in results {
        assert_eq!(out, expected);
    }
}

#[test]
fn test_topology_from_groups() {
    let configs = hierarchical_configs(&["x", "y", "x", "y", "x"], |_| {});
    let topo: Vec<_> = configs.iter().map(|c| *c.topology()).collect();
    assert!(topo.iter().all(|t| t.global_num_gpus == 5 && t.global_num_nodes == 2));
    assert_eq!(
        (topo[0].global_node_rank, topo[0].local_num_gpus, topo[0].local_gpu_rank),
        (0, 3, 0)
    );
    assert_eq!(
        (topo[3].global_node_rank, topo[3].local_num_gpus, topo[3].local_gpu_rank),
        (1, 2, 1)
    );
    assert_eq!(topo[4].global_gpu_rank, 4);
}
