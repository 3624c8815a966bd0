//! Equality-predicate extraction from parsed statements
//!
//! The proxy only parses enough SQL to find the sharding columns: the
//! equality comparisons on top-level WHERE conjuncts. Everything else in
//! the statement is opaque and forwarded verbatim.

use crate::shard_key::KeyValue;
use sqlparser::ast::{BinaryOperator, Expr, SetExpr, Statement, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use spqr_common::{Result, SpqrError};

/// Parse a query string into a single statement.
pub fn parse_single_statement(sql: &str) -> Result<Statement> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| SpqrError::NoRouteForStatement(format!("parse error: {}", e)))?;

    if statements.len() != 1 {
        return Err(SpqrError::NoRouteForStatement(format!(
            "expected a single statement, got {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

/// Extract `(column, value)` pairs from the statement's top-level WHERE
/// equality conjuncts. Column names are lowercased; disjuncts and
/// non-equality comparisons are ignored.
pub fn extract_equality_predicates(stmt: &Statement) -> Vec<(String, KeyValue)> {
    let selection = match stmt {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select.selection.as_ref(),
            _ => None,
        },
        Statement::Update { selection, .. } => selection.as_ref(),
        Statement::Delete(delete) => delete.selection.as_ref(),
        _ => None,
    };

    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_conjuncts(expr, &mut pairs);
    }
    pairs
}

fn collect_conjuncts(expr: &Expr, pairs: &mut Vec<(String, KeyValue)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, pairs);
            collect_conjuncts(right, pairs);
        }
        Expr::Nested(inner) => collect_conjuncts(inner, pairs),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if let Some(pair) = as_column_value(left, right).or_else(|| as_column_value(right, left))
            {
                pairs.push(pair);
            }
        }
        _ => {}
    }
}

fn as_column_value(column: &Expr, value: &Expr) -> Option<(String, KeyValue)> {
    let name = match column {
        Expr::Identifier(ident) => ident.value.to_lowercase(),
        Expr::CompoundIdentifier(idents) => idents.last()?.value.to_lowercase(),
        _ => return None,
    };

    let value = match value {
        Expr::Value(Value::Number(n, _)) => KeyValue::Int(n.parse().ok()?),
        Expr::Value(Value::SingleQuotedString(s)) => KeyValue::Bytes(s.as_bytes().to_vec()),
        Expr::Value(Value::HexStringLiteral(s)) => KeyValue::Bytes(hex::decode(s).ok()?),
        _ => return None,
    };

    Some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicates(sql: &str) -> Vec<(String, KeyValue)> {
        let stmt = parse_single_statement(sql).unwrap();
        extract_equality_predicates(&stmt)
    }

    #[test]
    fn test_select_single_equality() {
        let pairs = predicates("SELECT * FROM t WHERE id = 64");
        assert_eq!(pairs, vec![("id".to_string(), KeyValue::Int(64))]);
    }

    #[test]
    fn test_conjunction_and_qualification() {
        let pairs = predicates("SELECT a FROM t WHERE t.id = 7 AND region = 'eu' AND x > 3");
        assert_eq!(
            pairs,
            vec![
                ("id".to_string(), KeyValue::Int(7)),
                ("region".to_string(), KeyValue::Bytes(b"eu".to_vec())),
            ]
        );
    }

    #[test]
    fn test_reversed_operands() {
        let pairs = predicates("SELECT * FROM t WHERE 5 = id");
        assert_eq!(pairs, vec![("id".to_string(), KeyValue::Int(5))]);
    }

    #[test]
    fn test_disjunction_ignored() {
        let pairs = predicates("SELECT * FROM t WHERE id = 1 OR id = 2");
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_update_and_delete() {
        let pairs = predicates("UPDATE t SET v = 1 WHERE id = 9");
        assert_eq!(pairs, vec![("id".to_string(), KeyValue::Int(9))]);

        let pairs = predicates("DELETE FROM t WHERE id = 11");
        assert_eq!(pairs, vec![("id".to_string(), KeyValue::Int(11))]);
    }

    #[test]
    fn test_no_where_clause() {
        assert!(predicates("SELECT * FROM t").is_empty());
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert!(parse_single_statement("SELECT 1; SELECT 2").is_err());
    }
}
