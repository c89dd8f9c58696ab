use std::collections::BTreeMap;

/// One job to move from an overloaded node to an underloaded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalancePlan {
    pub mean: f64,
    pub overloaded: Vec<String>,
    pub underloaded: Vec<String>,
    pub migrations: Vec<Migration>,
}

/// Classify nodes by job count against the mean and plan at most one
/// migration per overloaded node, always towards the currently least
/// loaded underloaded node.
pub fn plan(
    load: &BTreeMap<String, usize>,
    overload_factor: f64,
    underload_factor: f64,
) -> RebalancePlan {
    if load.is_empty() {
        return RebalancePlan::default();
    }
    let total: usize = load.values().sum();
    let mean = total as f64 / load.len() as f64;

    let mut overloaded: Vec<(&String, usize)> = load
        .iter()
        .filter(|(_, &c)| c as f64 > overload_factor * mean)
        .map(|(id, &c)| (id, c))
        .collect();
    let mut underloaded: Vec<(&String, usize)> = load
        .iter()
        .filter(|(_, &c)| (c as f64) < underload_factor * mean)
        .map(|(id, &c)| (id, c))
        .collect();

    let mut plan = RebalancePlan {
        mean,
        overloaded: overloaded.iter().map(|(id, _)| (*id).clone()).collect(),
        underloaded: underloaded.iter().map(|(id, _)| (*id).clone()).collect(),
        migrations: Vec::new(),
    };
    if overloaded.is_empty() || underloaded.is_empty() {
        return plan;
    }

    overloaded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    for (from, count) in overloaded {
        let Some(target) = underloaded
            .iter_mut()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        else {
            break;
        };
        // Moving must not just swap which node is overloaded.
        if target.1 + 1 >= count {
            continue;
        }
        target.1 += 1;
        plan.migrations.push(Migration {
            from: from.clone(),
            to: target.0.clone(),
        });
    }
    plan
}
