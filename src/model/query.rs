use serde_json::Value;

use super::EntryContent;
use crate::error::{Error, Result};

/// Type of a [`Query`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryType {
    Identity,
    IdentityJson,
    IdentityText,
    JsonPath(Vec<String>),
}

/// A Query on a file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub(crate) path: String,
    pub(crate) r#type: QueryType,
}

impl Query {
    fn normalize_path(path: &str) -> String {
        if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{}", path)
        }
    }

    /// Returns a newly-created [`Query`] that retrieves the content as it is.
    /// Returns `None` if path is empty
    pub fn identity(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::Identity,
        })
    }

    /// Returns a newly-created [`Query`] that retrieves the textual content as it is.
    /// Returns `None` if path is empty
    pub fn of_text(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::IdentityText,
        })
    }

    /// Returns a newly-created [`Query`] that retrieves the JSON content as it is.
    /// Returns `None` if path is empty
    pub fn of_json(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::IdentityJson,
        })
    }

    /// Returns a newly-created [`Query`] that applies a series of
    /// [JSON path expressions](https://github.com/json-path/JsonPath/blob/master/README.md)
    /// to the content.
    /// Returns `None` if path is empty or does not end with `.json`.
    pub fn of_json_path(path: &str, exprs: Vec<String>) -> Option<Self> {
        if !path.to_lowercase().ends_with("json") {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::JsonPath(exprs),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_type(&self) -> &QueryType {
        &self.r#type
    }

    /// Applies this query's projection to the given content.
    ///
    /// Identity returns the content untouched. The text projection coerces
    /// JSON and YAML to their textual form. The JSON projection parses YAML
    /// into a JSON value. JSON-Path expressions are applied in order, each
    /// one consuming the previous output; anything that cannot be evaluated
    /// against the content's kind fails with
    /// [`Error::QueryExecution`].
    pub fn apply(&self, content: &EntryContent) -> Result<EntryContent> {
        match &self.r#type {
            QueryType::Identity => Ok(content.clone()),
            QueryType::IdentityText => match content {
                EntryContent::Text(s) => Ok(EntryContent::Text(s.clone())),
                EntryContent::Yaml(s) => Ok(EntryContent::Text(s.clone())),
                EntryContent::Json(v) => Ok(EntryContent::Text(v.to_string())),
                EntryContent::Directory => Err(Error::QueryExecution(
                    "cannot query a directory".to_string(),
                )),
            },
            QueryType::IdentityJson => Ok(EntryContent::Json(json_value_of(content)?)),
            QueryType::JsonPath(exprs) => {
                let mut value = json_value_of(content)?;
                for expr in exprs {
                    value = select_json_path(&value, expr)?;
                }
                Ok(EntryContent::Json(value))
            }
        }
    }

    /// The projected value used for watch comparison. Two projections are
    /// distinct iff these values differ structurally.
    pub fn projected_value(&self, content: &EntryContent) -> Result<Value> {
        match self.apply(content)? {
            EntryContent::Json(v) => Ok(v),
            EntryContent::Text(s) => Ok(Value::String(s)),
            EntryContent::Yaml(s) => Ok(Value::String(s)),
            EntryContent::Directory => Err(Error::QueryExecution(
                "cannot query a directory".to_string(),
            )),
        }
    }
}

fn json_value_of(content: &EntryContent) -> Result<Value> {
    match content {
        EntryContent::Json(v) => Ok(v.clone()),
        EntryContent::Yaml(s) => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(s)?;
            serde_json::to_value(yaml)
                .map_err(|e| Error::QueryExecution(format!("yaml is not convertible: {}", e)))
        }
        EntryContent::Text(_) => Err(Error::QueryExecution(
            "JSON query on a text file".to_string(),
        )),
        EntryContent::Directory => Err(Error::QueryExecution(
            "cannot query a directory".to_string(),
        )),
    }
}

fn select_json_path(value: &Value, expr: &str) -> Result<Value> {
    let matched = jsonpath_lib::select(value, expr)
        .map_err(|e| Error::QueryExecution(format!("{}: {:?}", expr, e)))?;
    match matched.len() {
        0 => Err(Error::QueryExecution(format!("no match: {}", expr))),
        // A single match is delivered as the value itself, the way a definite
        // path behaves in Jayway.
        1 => Ok(matched[0].clone()),
        _ => Ok(Value::Array(matched.into_iter().cloned().collect())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_path_single_match() {
        let q = Query::of_json_path("/a.json", vec!["$[0]".to_string()]).unwrap();
        let out = q.apply(&EntryContent::Json(json!([1, 2, 3]))).unwrap();
        assert_eq!(out, EntryContent::Json(json!(1)));
    }

    #[test]
    fn json_path_chained() {
        let q = Query::of_json_path("/a.json", vec!["$.a".to_string(), "$.b".to_string()])
            .unwrap();
        let out = q
            .apply(&EntryContent::Json(json!({"a": {"b": "c"}})))
            .unwrap();
        assert_eq!(out, EntryContent::Json(json!("c")));
    }

    #[test]
    fn json_path_on_text_fails() {
        let q = Query::of_json_path("/a.json", vec!["$.a".to_string()]).unwrap();
        let out = q.apply(&EntryContent::Text("not json".to_string()));
        assert!(matches!(out, Err(Error::QueryExecution(_))));
    }

    #[test]
    fn text_projection_coerces_json() {
        let q = Query::of_text("/a.json").unwrap();
        let out = q.apply(&EntryContent::Json(json!({"a": 1}))).unwrap();
        assert_eq!(out, EntryContent::Text("{\"a\":1}".to_string()));
    }

    #[test]
    fn json_projection_parses_yaml() {
        let q = Query::of_json("/a.yml").unwrap();
        let out = q
            .apply(&EntryContent::Yaml("a: 1\n".to_string()))
            .unwrap();
        assert_eq!(out, EntryContent::Json(json!({"a": 1})));
    }

    #[test]
    fn query_path_is_normalized() {
        assert_eq!(Query::identity("a.json").unwrap().path(), "/a.json");
        assert!(Query::identity("").is_none());
        assert!(Query::of_json_path("/a.txt", vec![]).is_none());
    }
}
