use nexar_dgc::{
    CommGroups, Communicator, Device, DeviceArena, DeviceStream, DgcConfig, Element, Layer,
    LocalComm, form_comm_groups,
};
use std::sync::Arc;

/// One configured worker per rank of an in-process group, all on one node.
pub fn local_configs(world_size: u32, tune: impl Fn(&mut DgcConfig)) -> Vec<DgcConfig> {
    LocalComm::group(world_size)
        .into_iter()
        .map(|comm| {
            let comm: Arc<dyn Communicator> = Arc::new(comm);
            configure(CommGroups::single_node(comm), &tune)
        })
        .collect()
}

/// One configured worker per entry of `hosts`, grouped into nodes by host.
pub fn hierarchical_configs(hosts: &[&str], tune: impl Fn(&mut DgcConfig)) -> Vec<DgcConfig> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(hosts.len())
        .enable_all()
        .build()
        .unwrap();
    let groups = runtime.block_on(async {
        let handles: Vec<_> = LocalComm::group(hosts.len() as u32)
            .into_iter()
            .zip(hosts)
            .map(|(comm, host)| {
                let host = host.to_string();
                tokio::spawn(async move {
                    let comm: Arc<dyn Communicator> = Arc::new(comm);
                    form_comm_groups(comm, &host).await.unwrap()
                })
            })
            .collect();
        let mut groups = Vec::new();
        for h in handles {
            groups.push(h.await.unwrap());
        }
        groups
    });
    groups.into_iter().map(|g| configure(g, &tune)).collect()
}

fn configure(groups: CommGroups, tune: &impl Fn(&mut DgcConfig)) -> DgcConfig {
    let mut config = DgcConfig::default()
        .with_stream(DeviceStream::new(Device::new()).unwrap())
        .with_comm_groups(groups);
    config.min_sampling_num = 100;
    config.local_gradient_clipping = false;
    config.grid_size = 4;
    config.block_size = 128;
    tune(&mut config);
    config.finish_configuration().unwrap();
    config
}

/// Run `f` for every rank on its own thread; results come back in rank order.
pub fn run_ranks<T, F>(configs: Vec<DgcConfig>, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(u32, DgcConfig) -> T + Sync,
{
    std::thread::scope(|s| {
        let handles: Vec<_> = configs
            .into_iter()
            .enumerate()
            .map(|(rank, config)| {
                let f = &f;
                s.spawn(move || f(rank as u32, config))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Copy `data` into a new arena on the config's device.
pub fn upload<T: Element>(config: &DgcConfig, label: &'static str, data: &[T]) -> Arc<DeviceArena> {
    let arena = config
        .stream()
        .unwrap()
        .device()
        .alloc(label, std::mem::size_of_val(data))
        .unwrap();
    arena.write(0, data).unwrap();
    arena
}

pub fn total_elements(layers: &[Layer]) -> usize {
    layers.iter().map(|l| l.num_elements).sum()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "index {i}: {a} != {e}");
    }
}
