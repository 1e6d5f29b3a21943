//! Document aggregation pipeline (§4.3 "aggregate"). Stages execute in
//! order; the output of stage N is the input of stage N+1, over the closed
//! stage set `{match, project, group, sort, limit, skip, unwind}`.

use mantisdb_core::error::{MantisError, MantisResult};
use serde_json::Value;

use crate::processing::{DocumentFilter, DocumentPaginator, DocumentSorter};
use crate::types::AggregateStage;
use crate::MultiModelStore;

impl MultiModelStore {
    pub fn document_aggregate(&self, collection: &str, pipeline: &[AggregateStage]) -> MantisResult<Vec<Value>> {
        let mut documents: Vec<Value> = self
            .storage
            .scan_prefix(&format!("doc:{collection}:"), None)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice::<Value>(&bytes).ok())
            .collect();

        for stage in pipeline {
            documents = apply_stage(documents, stage)?;
        }
        Ok(documents)
    }
}

fn apply_stage(documents: Vec<Value>, stage: &AggregateStage) -> MantisResult<Vec<Value>> {
    match stage {
        AggregateStage::Match(filter) => Ok(DocumentFilter::filter_documents(documents, filter)),
        AggregateStage::Project(spec) => Ok(documents.iter().map(|d| project(d, spec)).collect()),
        AggregateStage::Sort(spec) => {
            let mut documents = documents;
            DocumentSorter::sort_documents(&mut documents, spec);
            Ok(documents)
        }
        AggregateStage::Limit(n) => Ok(DocumentPaginator::paginate_documents(documents, None, Some(*n))),
        AggregateStage::Skip(n) => Ok(DocumentPaginator::paginate_documents(documents, Some(*n), None)),
        AggregateStage::Unwind(field) => Ok(unwind(documents, field)),
        AggregateStage::Group(group) => group_documents(documents, group),
    }
}

fn project(document: &Value, spec: &Value) -> Value {
    let Value::Object(fields) = spec else { return document.clone() };
    let Value::Object(source) = document else { return document.clone() };
    let mut out = serde_json::Map::new();
    for (field, include) in fields {
        let wanted = match include {
            Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
            Value::Bool(b) => *b,
            _ => false,
        };
        if wanted {
            if let Some(v) = source.get(field) {
                out.insert(field.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn unwind(documents: Vec<Value>, field: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for document in documents {
        let Value::Object(obj) = &document else { continue };
        match obj.get(field) {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut clone = obj.clone();
                    clone.insert(field.to_string(), item.clone());
                    out.push(Value::Object(clone));
                }
            }
            _ => out.push(document.clone()),
        }
    }
    out
}

fn group_documents(documents: Vec<Value>, group: &crate::types::GroupStage) -> MantisResult<Vec<Value>> {
    use std::collections::BTreeMap;

    let mut buckets: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for document in &documents {
        let key = match &group.id_field {
            Some(field) => DocumentFilter::get_nested_field(document, field).to_string(),
            None => "null".to_string(),
        };
        buckets.entry(key).or_default().push(document.clone());
    }

    let mut results = Vec::with_capacity(buckets.len());
    for (key, members) in buckets {
        let mut out = serde_json::Map::new();
        let id_value = members
            .first()
            .and_then(|d| group.id_field.as_ref().map(|f| DocumentFilter::get_nested_field(d, f)))
            .unwrap_or(Value::Null);
        out.insert("_id".to_string(), id_value);
        let _ = key;

        for (accumulator_name, expr) in &group.accumulators {
            let Value::Object(op) = expr else {
                return Err(MantisError::SchemaViolation(format!(
                    "group accumulator '{accumulator_name}' must be an operator object"
                )));
            };
            let (op_name, arg) = op
                .iter()
                .next()
                .ok_or_else(|| MantisError::SchemaViolation(format!("empty accumulator '{accumulator_name}'")))?;
            let value = apply_accumulator(op_name, arg, &members)?;
            out.insert(accumulator_name.clone(), value);
        }

        results.push(Value::Object(out));
    }
    Ok(results)
}

fn apply_accumulator(op: &str, arg: &Value, members: &[Value]) -> MantisResult<Value> {
    let Value::String(field) = arg else {
        return Err(MantisError::SchemaViolation(format!("accumulator operand for '{op}' must be a field name string")));
    };
    let values: Vec<f64> = members
        .iter()
        .filter_map(|d| DocumentFilter::get_nested_field(d, field).as_f64())
        .collect();

    let result = match op {
        "$sum" => Value::from(values.iter().sum::<f64>()),
        "$avg" => {
            if values.is_empty() {
                Value::Null
            } else {
                Value::from(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "$min" => values.iter().cloned().fold(f64::INFINITY, f64::min).into(),
        "$max" => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max).into(),
        "$count" => Value::from(members.len()),
        "$push" => Value::Array(members.iter().map(|d| DocumentFilter::get_nested_field(d, field)).collect()),
        other => return Err(MantisError::SchemaViolation(format!("unsupported accumulator '{other}'"))),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MultiModelStore;
    use serde_json::json;

    #[test]
    fn pipeline_match_then_group_sum() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store.document_put("orders", "1", json!({"region": "east", "amount": 10})).unwrap();
        store.document_put("orders", "2", json!({"region": "east", "amount": 20})).unwrap();
        store.document_put("orders", "3", json!({"region": "west", "amount": 5})).unwrap();

        let mut accumulators = serde_json::Map::new();
        accumulators.insert("total".to_string(), json!({"$sum": "amount"}));
        let pipeline = vec![crate::types::AggregateStage::Group(crate::types::GroupStage {
            id_field: Some("region".to_string()),
            accumulators,
        })];

        let result = store.document_aggregate("orders", &pipeline).unwrap();
        assert_eq!(result.len(), 2);
        let east = result.iter().find(|d| d["_id"] == json!("east")).unwrap();
        assert_eq!(east["total"], json!(30.0));
    }

    #[test]
    fn pipeline_unwind_expands_array_field() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store.document_put("posts", "1", json!({"tags": ["a", "b"]})).unwrap();
        let pipeline = vec![crate::types::AggregateStage::Unwind("tags".to_string())];
        let result = store.document_aggregate("posts", &pipeline).unwrap();
        assert_eq!(result.len(), 2);
    }
}
