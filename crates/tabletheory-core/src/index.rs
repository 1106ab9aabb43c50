//! Index selection scoring (spec §4.F).

use crate::registry::{IndexSchema, IndexType, Metadata, ProjectionType};

/// The key shape a query needs satisfied.
#[derive(Debug, Clone)]
pub struct RequiredKeys {
    pub partition: String,
    pub sort: Option<String>,
    /// Whether a sort-key operator beyond equality was requested (range,
    /// BETWEEN, BEGINS_WITH); this only matters once a sort field is
    /// present.
    pub sort_op: Option<crate::expr::Operator>,
}

/// Picks the highest-scoring index for `required`, per §4.F's scoring
/// table; ties resolve to the first-defined candidate. Returns `None` if no
/// index can serve the partition key at all.
pub fn select_index<'a>(meta: &'a Metadata, required: &RequiredKeys) -> Option<&'a IndexSchema> {
    let mut best: Option<(&IndexSchema, i32)> = None;

    for index in &meta.indexes {
        let Some(score) = score_index(meta, index, required) else {
            continue;
        };
        match &best {
            Some((_, best_score)) if *best_score >= score => {}
            _ => best = Some((index, score)),
        }
    }

    best.map(|(index, _)| index)
}

fn score_index(meta: &Metadata, index: &IndexSchema, required: &RequiredKeys) -> Option<i32> {
    if index.partition_field != required.partition {
        return None;
    }
    let mut score = 100;

    if let Some(sort) = &required.sort {
        if index.sort_field.as_deref() == Some(sort.as_str()) {
            score += 50;
            if sort_operator_feasible(required.sort_op) {
                score += 25;
            }
        }
    }

    if index.projection_type == ProjectionType::All {
        score += 10;
    }

    if index.index_type == IndexType::Primary && meta.indexes.iter().any(|i| i.index_type != IndexType::Primary) {
        score += 5;
    }

    Some(score)
}

fn sort_operator_feasible(op: Option<crate::expr::Operator>) -> bool {
    use crate::expr::Operator;
    matches!(
        op,
        None | Some(Operator::Eq)
            | Some(Operator::Lt)
            | Some(Operator::Le)
            | Some(Operator::Gt)
            | Some(Operator::Ge)
            | Some(Operator::Between)
            | Some(Operator::BeginsWith)
    )
}
