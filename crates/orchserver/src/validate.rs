//! Request shapes accepted by the HTTP API and the checks they pass before
//! reaching the orchestrator.

use orchcore::{ExecutionId, WorkflowDefinition};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

pub trait Validate {
    /// Every violation found, not just the first
    fn validate(&self) -> Result<(), Vec<String>>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TriggerRequest {
    #[serde(default)]
    pub global_vars: HashMap<String, Value>,
}

impl Validate for TriggerRequest {
    fn validate(&self) -> Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .global_vars
            .keys()
            .filter(|k| k.trim().is_empty())
            .map(|_| "globalVars keys must not be empty".to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionsQuery {
    pub limit: Option<usize>,
}

impl ExecutionsQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }
}

impl Validate for ExecutionsQuery {
    fn validate(&self) -> Result<(), Vec<String>> {
        match self.limit {
            Some(limit) if limit == 0 || limit > MAX_LIST_LIMIT => {
                Err(vec![format!("limit must be between 1 and {}", MAX_LIST_LIMIT)])
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl PageQuery {
    pub fn page(&self) -> usize {
        self.page.unwrap_or(1)
    }

    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

impl Validate for PageQuery {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.page == Some(0) {
            errors.push("page starts at 1".to_string());
        }
        if let Some(size) = self.page_size {
            if size == 0 || size > MAX_PAGE_SIZE {
                errors.push(format!("pageSize must be between 1 and {}", MAX_PAGE_SIZE));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Validate for WorkflowDefinition {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if let Err(e) = WorkflowDefinition::validate(self) {
            errors.push(e.to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

pub fn parse_execution_id(raw: &str) -> Result<ExecutionId, Vec<String>> {
    raw.parse()
        .map_err(|_| vec![format!("'{}' is not a valid execution id", raw)])
}
