//! Start ordering for plugins that declare `dependencies`.

use std::collections::{BTreeMap, VecDeque};

use tracing::warn;

use crate::descriptor::PluginDescriptor;

/// Order descriptors so that dependencies come before their dependents.
///
/// Stable: unrelated plugins keep their discovery order. Dependencies on
/// plugins that were not discovered are ignored. A cycle does not fail the
/// pass; the plugins caught in it are appended in discovery order.
pub fn order_by_dependencies(descriptors: Vec<PluginDescriptor>) -> Vec<PluginDescriptor> {
    let index: BTreeMap<String, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.clone(), i))
        .collect();

    let mut indegree = vec![0usize; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];

    for (i, d) in descriptors.iter().enumerate() {
        for dep in &d.dependencies {
            match index.get(dep) {
                Some(&j) if j != i => {
                    indegree[i] += 1;
                    dependents[j].push(i);
                },
                Some(_) => warn!(plugin = %d.name, "plugin lists itself as a dependency"),
                None => warn!(plugin = %d.name, dependency = %dep, "unknown plugin dependency"),
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..descriptors.len())
        .filter(|&i| indegree[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(descriptors.len());
    let mut placed = vec![false; descriptors.len()];

    while let Some(i) = pop_lowest(&mut ready) {
        order.push(i);
        placed[i] = true;
        for &k in &dependents[i] {
            indegree[k] -= 1;
            if indegree[k] == 0 {
                ready.push_back(k);
            }
        }
    }

    if order.len() < descriptors.len() {
        let stuck: Vec<&str> = descriptors
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, d)| d.name.as_str())
            .collect();
        warn!(plugins = ?stuck, "dependency cycle, starting remaining plugins in discovery order");
        order.extend((0..descriptors.len()).filter(|&i| !placed[i]));
    }

    let mut slots: Vec<Option<PluginDescriptor>> = descriptors.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect()
}

/// Take the ready entry with the smallest discovery index.
fn pop_lowest(ready: &mut VecDeque<usize>) -> Option<usize> {
    let (pos, _) = ready.iter().enumerate().min_by_key(|(_, i)| **i)?;
    ready.remove(pos)
}
