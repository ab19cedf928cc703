//! Schema-related data models.
//!
//! This module defines types for database schema introspection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
    SystemTable,
}

impl TableType {
    /// Icon name used by the browse tree.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
            Self::SystemTable => "stable",
        }
    }

    /// Parse an information_schema style table type.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "VIEW" => Self::View,
            "SYSTEM VIEW" | "SYSTEM TABLE" => Self::SystemTable,
            _ => Self::Table,
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::View => write!(f, "view"),
            Self::SystemTable => write!(f, "system_table"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: TableType,
    pub description: String,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            table_type,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// One column as reported by `SHOW COLUMNS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Type without size, e.g. `varchar`
    pub column_type: String,
    /// Type as declared, e.g. `varchar(255)`
    pub full_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    pub icon: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub extra: String,
    /// `PRI`, `UNI`, `MUL` or empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub index: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub description: String,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, full_type: impl Into<String>) -> Self {
        let full_type = full_type.into();
        Self {
            name: name.into(),
            column_type: full_type.clone(),
            full_type,
            scale: None,
            precision: None,
            icon: "what".to_string(),
            nullable: false,
            default: None,
            extra: String::new(),
            key: String::new(),
            index: false,
            unique: false,
            primary_key: false,
            description: String::new(),
        }
    }
}

/// One entry of the browse tree: a table with its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNode {
    pub table: TableInfo,
    pub icon: String,
    pub columns: Vec<ColumnDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_type_parsing() {
        assert_eq!(TableType::parse("BASE TABLE"), TableType::Table);
        assert_eq!(TableType::parse("view"), TableType::View);
        assert_eq!(TableType::parse("SYSTEM VIEW"), TableType::SystemTable);
    }

    #[test]
    fn test_table_icons() {
        assert_eq!(TableType::Table.icon(), "table");
        assert_eq!(TableType::SystemTable.icon(), "stable");
        assert_eq!(TableType::SystemTable.to_string(), "system_table");
    }
}
