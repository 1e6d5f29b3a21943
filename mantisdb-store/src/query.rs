//! Query view: a small read-only SQL subset over columnar tables (§4.3
//! "Query view (SQL)"). This engine owns only a consistent per-call
//! snapshot and predicate/sort/limit evaluation — a real SQL planner,
//! joins, and subqueries are out of scope (§1 Non-goals) and are an
//! external collaborator's concern.
//!
//! Supported grammar:
//! `SELECT <* | col[, col...]> FROM <table> [WHERE <col> <op> <value>
//! [AND <col> <op> <value>]...] [ORDER BY <col> [ASC|DESC]] [LIMIT <n>]
//! [OFFSET <n>]`

use mantisdb_core::error::{MantisError, MantisResult};
use serde_json::Value;
use std::time::Instant;

use crate::types::{RowQuery, SqlQueryResult};
use crate::MultiModelStore;

impl MultiModelStore {
    pub fn sql_query(&self, statement: &str) -> MantisResult<SqlQueryResult> {
        let start = Instant::now();
        let parsed = parse(statement)?;

        let row_query = RowQuery {
            select: if parsed.columns == vec!["*"] { None } else { Some(parsed.columns.clone()) },
            r#where: parsed.filter,
            order_by: parsed.order_by,
            limit: parsed.limit,
            offset: parsed.offset,
        };
        let result = self.columnar_query(&parsed.table, &row_query)?;

        let columns = if parsed.columns == vec!["*"] {
            self.describe_table(&parsed.table)?
                .schema
                .columns
                .into_iter()
                .map(|c| c.name)
                .collect()
        } else {
            parsed.columns
        };

        let rows: Vec<Vec<Value>> = result
            .rows
            .iter()
            .map(|row| columns.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect())
            .collect();

        Ok(SqlQueryResult {
            row_count: rows.len(),
            columns,
            rows,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

struct ParsedSelect {
    columns: Vec<String>,
    table: String,
    filter: Option<Value>,
    order_by: Option<Value>,
    limit: Option<usize>,
    offset: Option<usize>,
}

fn parse(statement: &str) -> MantisResult<ParsedSelect> {
    let upper = statement.to_uppercase();
    let tokens_upper: Vec<&str> = upper.split_whitespace().collect();
    let tokens: Vec<&str> = statement.split_whitespace().collect();
    if tokens_upper.is_empty() || tokens_upper[0] != "SELECT" {
        return Err(MantisError::SchemaViolation("statement must start with SELECT".to_string()));
    }

    let from_idx = tokens_upper
        .iter()
        .position(|t| *t == "FROM")
        .ok_or_else(|| MantisError::SchemaViolation("missing FROM clause".to_string()))?;
    let columns: Vec<String> = tokens[1..from_idx]
        .join(" ")
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() {
        return Err(MantisError::SchemaViolation("empty select list".to_string()));
    }

    let table = tokens
        .get(from_idx + 1)
        .ok_or_else(|| MantisError::SchemaViolation("missing table name".to_string()))?
        .trim_end_matches(';')
        .to_string();

    let where_idx = tokens_upper.iter().position(|t| *t == "WHERE");
    let order_idx = tokens_upper.windows(2).position(|w| w == ["ORDER", "BY"]);
    let limit_idx = tokens_upper.iter().position(|t| *t == "LIMIT");
    let offset_idx = tokens_upper.iter().position(|t| *t == "OFFSET");

    let clause_end = [order_idx, limit_idx, offset_idx].into_iter().flatten().min().unwrap_or(tokens.len());

    let filter = match where_idx {
        Some(idx) => Some(parse_where(&tokens[idx + 1..clause_end], &tokens_upper[idx + 1..clause_end])?),
        None => None,
    };

    let order_by = match order_idx {
        Some(idx) => {
            let field = tokens.get(idx + 2).ok_or_else(|| MantisError::SchemaViolation("missing ORDER BY column".to_string()))?;
            let descending = tokens_upper.get(idx + 3).map(|t| *t == "DESC").unwrap_or(false);
            Some(serde_json::json!({ field.trim_end_matches(','): if descending { -1 } else { 1 } }))
        }
        None => None,
    };

    let limit = match limit_idx {
        Some(idx) => Some(parse_usize(&tokens, idx)?),
        None => None,
    };
    let offset = match offset_idx {
        Some(idx) => Some(parse_usize(&tokens, idx)?),
        None => None,
    };

    Ok(ParsedSelect { columns, table, filter, order_by, limit, offset })
}

fn parse_usize(tokens: &[&str], keyword_idx: usize) -> MantisResult<usize> {
    tokens
        .get(keyword_idx + 1)
        .and_then(|t| t.trim_end_matches(';').parse().ok())
        .ok_or_else(|| MantisError::SchemaViolation("expected an integer literal".to_string()))
}

/// Parse `col op value [AND col op value]...` into a `$and`-joined
/// MongoDB-style filter reused by `DocumentFilter` (§4.3). `tokens_upper` is
/// the uppercased parallel slice, used only to find `AND` case-insensitively.
fn parse_where(tokens: &[&str], tokens_upper: &[&str]) -> MantisResult<Value> {
    let mut groups: Vec<Vec<&str>> = vec![Vec::new()];
    for (token, token_upper) in tokens.iter().zip(tokens_upper.iter()) {
        if *token_upper == "AND" {
            groups.push(Vec::new());
        } else {
            groups.last_mut().unwrap().push(token);
        }
    }

    let mut conditions = Vec::with_capacity(groups.len());
    for group in groups {
        let parts = &group[..];
        let [field, op, literal] = parts else {
            return Err(MantisError::SchemaViolation(format!("malformed WHERE clause: '{}'", group.join(" "))));
        };
        let field = *field;
        let op = *op;
        let literal = *literal;
        let value = parse_literal(literal);
        let condition = match op {
            "=" => serde_json::json!({ field: value }),
            "!=" => serde_json::json!({ field: { "$ne": value } }),
            ">" => serde_json::json!({ field: { "$gt": value } }),
            ">=" => serde_json::json!({ field: { "$gte": value } }),
            "<" => serde_json::json!({ field: { "$lt": value } }),
            "<=" => serde_json::json!({ field: { "$lte": value } }),
            other => return Err(MantisError::SchemaViolation(format!("unsupported operator '{other}'"))),
        };
        conditions.push(condition);
    }
    if conditions.len() == 1 {
        Ok(conditions.into_iter().next().unwrap())
    } else {
        Ok(serde_json::json!({ "$and": conditions }))
    }
}

fn parse_literal(token: &str) -> Value {
    let token = token.trim().trim_end_matches(';');
    if let Some(quoted) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Value::String(quoted.to_string());
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(n) = token.parse::<f64>() {
        return Value::from(n);
    }
    match token {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnDef;
    use crate::types::ColumnType;
    use serde_json::json;

    fn store_with_people() -> MultiModelStore {
        let store = MultiModelStore::new(1024 * 1024, None);
        store
            .create_table(
                "people",
                vec![
                    ColumnDef { name: "id".to_string(), ty: ColumnType::Int, nullable: false, primary_key: true, default: None },
                    ColumnDef { name: "age".to_string(), ty: ColumnType::Int, nullable: false, primary_key: false, default: None },
                ],
            )
            .unwrap();
        store.insert("people", vec![json!({"id": 1, "age": 17}), json!({"id": 2, "age": 25}), json!({"id": 3, "age": 40})]).unwrap();
        store
    }

    #[test]
    fn select_star_with_where_gt() {
        let store = store_with_people();
        let result = store.sql_query("SELECT * FROM people WHERE age > 18").unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns, vec!["id", "age"]);
    }

    #[test]
    fn select_columns_with_limit() {
        let store = store_with_people();
        let result = store.sql_query("SELECT id FROM people LIMIT 1").unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.columns, vec!["id"]);
    }

    #[test]
    fn select_with_order_by_desc() {
        let store = store_with_people();
        let result = store.sql_query("SELECT id FROM people ORDER BY age DESC").unwrap();
        let ids: Vec<i64> = result.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn missing_from_clause_is_rejected() {
        let store = MultiModelStore::new(1024 * 1024, None);
        assert!(matches!(store.sql_query("SELECT *"), Err(MantisError::SchemaViolation(_))));
    }
}
