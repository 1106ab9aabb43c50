//! Reserved-word-safe placeholder allocation (spec §4.E).

use std::collections::BTreeMap;

use crate::encoding::AttributeValue;
use crate::error::{Result, TableTheoryError};

/// A condition/filter operator, normalized from any accepted synonym.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    In,
    BeginsWith,
    Contains,
    Exists,
    NotExists,
}

impl Operator {
    /// Parses an operator token, accepting both symbolic and mnemonic
    /// synonyms (`=`/`EQ`, `<`/`LT`, …).
    pub fn parse(token: &str) -> Result<Self> {
        Ok(match token.to_ascii_uppercase().as_str() {
            "=" | "EQ" => Self::Eq,
            "<>" | "NE" => Self::Ne,
            "<" | "LT" => Self::Lt,
            "<=" | "LE" => Self::Le,
            ">" | "GT" => Self::Gt,
            ">=" | "GE" => Self::Ge,
            "BETWEEN" => Self::Between,
            "IN" => Self::In,
            "BEGINS_WITH" => Self::BeginsWith,
            "CONTAINS" => Self::Contains,
            "EXISTS" => Self::Exists,
            "NOT_EXISTS" => Self::NotExists,
            other => return Err(TableTheoryError::InvalidOperator(format!("unknown operator {other:?}"))),
        })
    }

    /// Validates the operand count for this operator (`IN` is capped at
    /// 100 per spec §4.E).
    pub fn check_arity(self, operand_count: usize) -> Result<()> {
        let ok = match self {
            Self::Exists | Self::NotExists => operand_count == 0,
            Self::Between => operand_count == 2,
            Self::In => operand_count >= 1 && operand_count <= 100,
            _ => operand_count == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(TableTheoryError::InvalidOperator(format!(
                "{self:?} does not accept {operand_count} operand(s)"
            )))
        }
    }
}

/// Boolean group combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// One compiled predicate clause, ready to render into an expression
/// string.
#[derive(Debug, Clone)]
pub struct Clause {
    pub field_placeholder: String,
    pub operator: Operator,
    pub value_placeholders: Vec<String>,
    pub combinator: BoolOp,
}

/// Allocates `#nK`/`:vK` placeholders in one independent namespace and
/// accumulates clauses into a single expression. One instance is used per
/// expression kind (update, key-condition, filter, projection) so that
/// namespaces never collide within a single compiled request.
#[derive(Debug, Default)]
pub struct ExpressionBuilder {
    names: BTreeMap<String, String>,
    name_lookup: BTreeMap<String, String>,
    values: BTreeMap<String, AttributeValue>,
    clauses: Vec<Clause>,
}

impl ExpressionBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves (or reuses) a `#nK` placeholder for `store_name`.
    pub fn name_placeholder(&mut self, store_name: &str) -> String {
        if let Some(existing) = self.name_lookup.get(store_name) {
            return existing.clone();
        }
        let placeholder = format!("#n{}", self.names.len() + 1);
        self.names.insert(placeholder.clone(), store_name.to_string());
        self.name_lookup.insert(store_name.to_string(), placeholder.clone());
        placeholder
    }

    /// Reserves a fresh `:vK` placeholder bound to `value`. Unlike name
    /// placeholders, values are never deduplicated: each call site binds
    /// its own operand even if two operands happen to encode identically.
    pub fn value_placeholder(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len() + 1);
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    /// Adds one predicate clause: `field OP value...`, combined with
    /// whatever precedes it via `combinator`.
    pub fn add_clause(
        &mut self,
        store_name: &str,
        operator: Operator,
        operands: Vec<AttributeValue>,
        combinator: BoolOp,
    ) -> Result<()> {
        operator.check_arity(operands.len())?;
        let field_placeholder = self.name_placeholder(store_name);
        let value_placeholders = operands.into_iter().map(|v| self.value_placeholder(v)).collect();
        self.clauses.push(Clause {
            field_placeholder,
            operator,
            value_placeholders,
            combinator,
        });
        Ok(())
    }

    /// Renders the accumulated clauses into a single expression string,
    /// preserving insertion order and parenthesizing `OR` groups: clauses
    /// joined by `OR` are grouped and wrapped in parens whenever the
    /// overall expression also contains an `AND`, so left-to-right
    /// insertion order survives the AND/OR precedence DynamoDB-class
    /// evaluators apply on emit.
    pub fn render(&self) -> Option<String> {
        if self.clauses.is_empty() {
            return None;
        }

        let mut groups: Vec<Vec<&Clause>> = Vec::new();
        for clause in &self.clauses {
            match clause.combinator {
                BoolOp::Or if !groups.is_empty() => groups.last_mut().unwrap().push(clause),
                _ => groups.push(vec![clause]),
            }
        }

        let multi_group = groups.len() > 1;
        let rendered: Vec<String> = groups
            .iter()
            .map(|group| {
                let joined = group.iter().map(|c| render_clause(c)).collect::<Vec<_>>().join(" OR ");
                if multi_group && group.len() > 1 {
                    format!("({joined})")
                } else {
                    joined
                }
            })
            .collect();

        Some(rendered.join(" AND "))
    }

    /// The `#nK -> store_name` map to submit alongside the expression.
    pub fn names(&self) -> &BTreeMap<String, String> {
        &self.names
    }

    /// The `:vK -> tagged value` map to submit alongside the expression.
    pub fn values(&self) -> &BTreeMap<String, AttributeValue> {
        &self.values
    }

    /// True if no clauses have been added.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Seeds this builder's placeholder counters and name deduplication map
    /// from `other`, so clauses built independently (key-condition vs.
    /// filter vs. projection) and later merged into one request never
    /// collide on `#nK`/`:vK` — each kind keeps its own `clauses` list but
    /// draws placeholders from a shared, continuing counter.
    pub fn seed_from(&mut self, other: &ExpressionBuilder) {
        self.names = other.names.clone();
        self.name_lookup = other.name_lookup.clone();
        self.values = other.values.clone();
    }
}

fn render_clause(clause: &Clause) -> String {
    let name = &clause.field_placeholder;
    match clause.operator {
        Operator::Eq => format!("{name} = {}", clause.value_placeholders[0]),
        Operator::Ne => format!("{name} <> {}", clause.value_placeholders[0]),
        Operator::Lt => format!("{name} < {}", clause.value_placeholders[0]),
        Operator::Le => format!("{name} <= {}", clause.value_placeholders[0]),
        Operator::Gt => format!("{name} > {}", clause.value_placeholders[0]),
        Operator::Ge => format!("{name} >= {}", clause.value_placeholders[0]),
        Operator::Between => format!(
            "{name} BETWEEN {} AND {}",
            clause.value_placeholders[0], clause.value_placeholders[1]
        ),
        Operator::In => format!("{name} IN ({})", clause.value_placeholders.join(", ")),
        Operator::BeginsWith => format!("begins_with({name}, {})", clause.value_placeholders[0]),
        Operator::Contains => format!("contains({name}, {})", clause.value_placeholders[0]),
        Operator::Exists => format!("attribute_exists({name})"),
        Operator::NotExists => format!("attribute_not_exists({name})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbolic_and_mnemonic_synonyms() {
        assert_eq!(Operator::parse("=").unwrap(), Operator::Eq);
        assert_eq!(Operator::parse("EQ").unwrap(), Operator::Eq);
        assert_eq!(Operator::parse("lt").unwrap(), Operator::Lt);
    }

    #[test]
    fn rejects_unknown_operator() {
        assert!(Operator::parse("WOBBLE").is_err());
    }

    #[test]
    fn rejects_bad_arity() {
        assert!(Operator::Between.check_arity(1).is_err());
        assert!(Operator::In.check_arity(101).is_err());
        assert!(Operator::Exists.check_arity(1).is_err());
    }

    #[test]
    fn placeholders_are_reserved_word_safe_and_deterministic() {
        let mut b = ExpressionBuilder::new();
        b.add_clause("reserved-keyword", Operator::Eq, vec![AttributeValue::S("x".into())], BoolOp::And)
            .unwrap();
        let rendered = b.render().unwrap();
        assert_eq!(rendered, "#n1 = :v1");
        assert_eq!(b.names().get("#n1").unwrap(), "reserved-keyword");
    }

    #[test]
    fn reuses_name_placeholder_for_repeated_field() {
        let mut b = ExpressionBuilder::new();
        b.add_clause("status", Operator::Eq, vec![AttributeValue::S("a".into())], BoolOp::And)
            .unwrap();
        b.add_clause("status", Operator::Ne, vec![AttributeValue::S("b".into())], BoolOp::Or)
            .unwrap();
        assert_eq!(b.names().len(), 1);
        assert_eq!(b.render().unwrap(), "#n1 = :v1 OR #n1 <> :v2");
    }

    #[test]
    fn parenthesizes_or_group_within_an_and_chain() {
        let mut b = ExpressionBuilder::new();
        b.add_clause("a", Operator::Eq, vec![AttributeValue::S("1".into())], BoolOp::And)
            .unwrap();
        b.add_clause("b", Operator::Eq, vec![AttributeValue::S("2".into())], BoolOp::Or)
            .unwrap();
        b.add_clause("c", Operator::Eq, vec![AttributeValue::S("3".into())], BoolOp::And)
            .unwrap();
        assert_eq!(b.render().unwrap(), "(#n1 = :v1 OR #n2 = :v2) AND #n3 = :v3");
    }

    #[test]
    fn renders_between_and_in() {
        let mut b = ExpressionBuilder::new();
        b.add_clause(
            "age",
            Operator::Between,
            vec![AttributeValue::N("1".into()), AttributeValue::N("9".into())],
            BoolOp::And,
        )
        .unwrap();
        assert_eq!(b.render().unwrap(), "#n1 BETWEEN :v1 AND :v2");
    }
}
