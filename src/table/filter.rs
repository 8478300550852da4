// src/table/filter.rs

use std::{cmp::Ordering, collections::HashMap};

use arrow::{
    array::{Array, BooleanArray, Float64Array, StringArray},
    record_batch::RecordBatch,
};
use pest::{
    iterators::{Pair, Pairs},
    Parser,
};
use pest_derive::Parser;

use crate::error::MetricError;
use crate::table::{numeric_column, text_column};

#[derive(Parser)]
#[grammar = "table/filter.pest"]
struct FilterParser;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Literal(Literal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            "==" => CmpOp::Eq,
            "!=" => CmpOp::Ne,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            _ => return None,
        })
    }

    /// `None` is an unordered pair (null or NaN on either side).
    fn holds(self, ord: Option<Ordering>) -> bool {
        match ord {
            None => self == CmpOp::Ne,
            Some(o) => match self {
                CmpOp::Eq => o == Ordering::Equal,
                CmpOp::Ne => o != Ordering::Equal,
                CmpOp::Lt => o == Ordering::Less,
                CmpOp::Le => o != Ordering::Greater,
                CmpOp::Gt => o == Ordering::Greater,
                CmpOp::Ge => o != Ordering::Less,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    Membership {
        operand: Operand,
        values: Vec<Literal>,
        negated: bool,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// A parsed geography-area filter, evaluated row by row over a source batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, MetricError> {
        let fail = |reason: String| MetricError::Filter {
            filter: source.to_string(),
            reason,
        };

        let mut pairs = FilterParser::parse(Rule::predicate, source).map_err(|e| fail(e.to_string()))?;
        let root = next(&mut pairs).map_err(fail)?;
        let or_expr = next(&mut root.into_inner()).map_err(fail)?;
        let expr = build_expr(or_expr).map_err(fail)?;

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Columns the filter reads, in order of first reference.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_columns(&self.expr, &mut out);
        out
    }

    /// Per-row mask over `batch`. Never contains nulls.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, MetricError> {
        let context = format!("filter `{}`", self.source);
        let mut columns = HashMap::new();
        for name in self.columns() {
            let is_numeric = batch
                .column_by_name(&name)
                .map(|c| c.data_type().is_numeric())
                .unwrap_or(false);
            let data = if is_numeric {
                ColumnData::Number(numeric_column(batch, &name, &context)?)
            } else {
                ColumnData::Text(text_column(batch, &name, &context)?)
            };
            columns.insert(name, data);
        }

        let mut mask = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let keep = eval_expr(&self.expr, &columns, row).map_err(|reason| MetricError::Filter {
                filter: self.source.clone(),
                reason,
            })?;
            mask.push(keep);
        }
        Ok(BooleanArray::from(mask))
    }
}

// ─── parse tree → Expr ───────────────────────────────────────────────

fn next<'i>(pairs: &mut Pairs<'i, Rule>) -> Result<Pair<'i, Rule>, String> {
    pairs
        .next()
        .ok_or_else(|| "malformed expression".to_string())
}

fn build_expr(pair: Pair<'_, Rule>) -> Result<Expr, String> {
    match pair.as_rule() {
        Rule::or_expr | Rule::and_expr => {
            let is_or = pair.as_rule() == Rule::or_expr;
            let mut parts = pair
                .into_inner()
                .filter(|p| !matches!(p.as_rule(), Rule::or_op | Rule::and_op))
                .map(build_expr)
                .collect::<Result<Vec<_>, _>>()?;
            if parts.len() == 1 {
                return Ok(parts.remove(0));
            }
            Ok(if is_or {
                Expr::Or(parts)
            } else {
                Expr::And(parts)
            })
        }
        Rule::unary => {
            let mut nots = 0;
            let mut inner = None;
            for p in pair.into_inner() {
                if p.as_rule() == Rule::not_op {
                    nots += 1;
                } else {
                    inner = Some(build_expr(p)?);
                }
            }
            let mut expr = inner.ok_or_else(|| "missing operand after `not`".to_string())?;
            for _ in 0..nots {
                expr = Expr::Not(Box::new(expr));
            }
            Ok(expr)
        }
        Rule::comparison => {
            let mut inner = pair.into_inner();
            let left = build_operand(next(&mut inner)?)?;
            let sym = next(&mut inner)?;
            let op = CmpOp::from_symbol(sym.as_str())
                .ok_or_else(|| format!("unknown operator `{}`", sym.as_str()))?;
            let right = build_operand(next(&mut inner)?)?;
            Ok(Expr::Compare { left, op, right })
        }
        Rule::membership => {
            let mut operand = None;
            let mut negated = false;
            let mut values = Vec::new();
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::negation => negated = true,
                    Rule::in_kw => {}
                    Rule::list => {
                        for item in p.into_inner() {
                            match build_operand(item)? {
                                Operand::Literal(lit) => values.push(lit),
                                Operand::Column(c) => {
                                    return Err(format!("column `{c}` inside an `in` list"))
                                }
                            }
                        }
                    }
                    _ => operand = Some(build_operand(p)?),
                }
            }
            let operand = operand.ok_or_else(|| "missing operand before `in`".to_string())?;
            Ok(Expr::Membership {
                operand,
                values,
                negated,
            })
        }
        other => Err(format!("unexpected {:?}", other)),
    }
}

fn build_operand(pair: Pair<'_, Rule>) -> Result<Operand, String> {
    match pair.as_rule() {
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(|n| Operand::Literal(Literal::Number(n)))
            .map_err(|e| format!("bad number `{}`: {e}", pair.as_str())),
        Rule::string => {
            let text = pair
                .into_inner()
                .next()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
            Ok(Operand::Literal(Literal::Text(text)))
        }
        Rule::column => {
            let ident = next(&mut pair.into_inner())?;
            let name = match ident.as_rule() {
                Rule::quoted_ident => ident
                    .into_inner()
                    .next()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default(),
                _ => ident.as_str().to_string(),
            };
            Ok(Operand::Column(name))
        }
        other => Err(format!("unexpected operand {:?}", other)),
    }
}

fn push_column(operand: &Operand, out: &mut Vec<String>) {
    if let Operand::Column(c) = operand {
        if !out.contains(c) {
            out.push(c.clone());
        }
    }
}

fn collect_columns(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Compare { left, right, .. } => {
            push_column(left, out);
            push_column(right, out);
        }
        Expr::Membership { operand, .. } => push_column(operand, out),
        Expr::And(parts) | Expr::Or(parts) => {
            for p in parts {
                collect_columns(p, out);
            }
        }
        Expr::Not(inner) => collect_columns(inner, out),
    }
}

// ─── evaluation ──────────────────────────────────────────────────────

enum ColumnData {
    Number(Float64Array),
    Text(StringArray),
}

#[derive(Debug, Clone, Copy)]
enum Cell<'a> {
    Null,
    Number(f64),
    Text(&'a str),
}

fn cell<'a>(
    operand: &'a Operand,
    columns: &'a HashMap<String, ColumnData>,
    row: usize,
) -> Result<Cell<'a>, String> {
    match operand {
        Operand::Literal(Literal::Number(n)) => Ok(Cell::Number(*n)),
        Operand::Literal(Literal::Text(s)) => Ok(Cell::Text(s)),
        Operand::Column(name) => match columns.get(name) {
            Some(ColumnData::Number(arr)) if arr.is_null(row) => Ok(Cell::Null),
            Some(ColumnData::Number(arr)) => Ok(Cell::Number(arr.value(row))),
            Some(ColumnData::Text(arr)) if arr.is_null(row) => Ok(Cell::Null),
            Some(ColumnData::Text(arr)) => Ok(Cell::Text(arr.value(row))),
            None => Err(format!("column `{name}` not loaded")),
        },
    }
}

fn compare(left: Cell<'_>, op: CmpOp, right: Cell<'_>) -> Result<bool, String> {
    match (left, right) {
        (Cell::Null, _) | (_, Cell::Null) => Ok(op.holds(None)),
        (Cell::Number(a), Cell::Number(b)) => Ok(op.holds(a.partial_cmp(&b))),
        (Cell::Text(a), Cell::Text(b)) => Ok(op.holds(Some(a.cmp(b)))),
        (l, r) => match op {
            CmpOp::Eq => Ok(false),
            CmpOp::Ne => Ok(true),
            _ => Err(format!("cannot order {:?} against {:?}", l, r)),
        },
    }
}

fn eval_expr(expr: &Expr, columns: &HashMap<String, ColumnData>, row: usize) -> Result<bool, String> {
    match expr {
        Expr::Compare { left, op, right } => {
            compare(cell(left, columns, row)?, *op, cell(right, columns, row)?)
        }
        Expr::Membership {
            operand,
            values,
            negated,
        } => {
            let value = cell(operand, columns, row)?;
            if matches!(value, Cell::Null) {
                return Ok(*negated);
            }
            let mut found = false;
            for lit in values {
                let lit_cell = match lit {
                    Literal::Number(n) => Cell::Number(*n),
                    Literal::Text(s) => Cell::Text(s),
                };
                if compare(value, CmpOp::Eq, lit_cell)? {
                    found = true;
                    break;
                }
            }
            Ok(found != *negated)
        }
        Expr::And(parts) => {
            for p in parts {
                if !eval_expr(p, columns, row)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(parts) => {
            for p in parts {
                if eval_expr(p, columns, row)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Not(inner) => Ok(!eval_expr(inner, columns, row)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn counties() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("CO_FIPS", DataType::Int64, true),
            Field::new("CO_NAME", DataType::Utf8, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(vec![
                    Some(3),
                    Some(11),
                    Some(49),
                    None,
                    Some(35),
                ])) as ArrayRef,
                Arc::new(StringArray::from(vec![
                    Some("BOX ELDER"),
                    Some("DAVIS"),
                    Some("UTAH"),
                    Some("SALT LAKE"),
                    None,
                ])) as ArrayRef,
            ],
        )
        .unwrap()
    }

    fn mask(filter: &str) -> Vec<bool> {
        let pred = Predicate::parse(filter).unwrap();
        let m = pred.evaluate(&counties()).unwrap();
        (0..m.len()).map(|i| m.value(i)).collect()
    }

    #[test]
    fn test_membership_over_numbers() {
        assert_eq!(
            mask("CO_FIPS in [3, 57, 11, 35]"),
            vec![true, true, false, false, true]
        );
        assert_eq!(
            mask("CO_FIPS not in [3, 57, 11, 35]"),
            vec![false, false, true, true, false]
        );
    }

    #[test]
    fn test_membership_over_strings() {
        assert_eq!(
            mask("CO_NAME in ['BOX ELDER', 'WEBER', 'DAVIS', 'SALT LAKE']"),
            vec![true, true, false, true, false]
        );
    }

    #[test]
    fn test_equality_and_self_comparison_drop_nulls() {
        assert_eq!(mask("CO_FIPS == 49"), vec![false, false, true, false, false]);
        assert_eq!(mask("CO_NAME == \"UTAH\""), vec![false, false, true, false, false]);
        // a column equals itself except where it is null
        assert_eq!(mask("CO_FIPS==CO_FIPS"), vec![true, true, true, false, true]);
        assert_eq!(mask("CO_NAME==CO_NAME"), vec![true, true, true, true, false]);
        assert_eq!(mask("CO_FIPS != 49"), vec![true, true, false, true, true]);
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        assert_eq!(
            mask("CO_FIPS < 20 or CO_NAME == 'UTAH' and CO_FIPS >= 49"),
            vec![true, true, true, false, false]
        );
        assert_eq!(
            mask("(CO_FIPS < 20 | CO_NAME == 'UTAH') & not CO_FIPS == 3"),
            vec![false, true, true, false, false]
        );
        assert_eq!(mask("~(CO_FIPS > 10)"), vec![true, false, false, true, false]);
    }

    #[test]
    fn test_columns_are_collected_once() {
        let pred = Predicate::parse("CO_FIPS == CO_FIPS and `CO_NAME` in ['A']").unwrap();
        assert_eq!(pred.columns(), vec!["CO_FIPS", "CO_NAME"]);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "CO_FIPS ==", "CO_FIPS in [A]", "(CO_FIPS == 3", "in == 3"] {
            let err = Predicate::parse(bad).unwrap_err();
            assert!(matches!(err, MetricError::Filter { .. }), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_ordering_text_against_number_fails() {
        let pred = Predicate::parse("CO_NAME > 3").unwrap();
        assert!(matches!(
            pred.evaluate(&counties()),
            Err(MetricError::Filter { .. })
        ));
        // equality across types is simply false
        assert_eq!(mask("CO_NAME == 3"), vec![false; 5]);
    }

    #[test]
    fn test_missing_column_is_reported() {
        let pred = Predicate::parse("COUNTY == 'Utah'").unwrap();
        assert!(matches!(
            pred.evaluate(&counties()),
            Err(MetricError::MissingColumn { .. })
        ));
    }
}
