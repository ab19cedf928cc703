//! MySQL type mappings.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `NativeType` identifies the wire-level field type of a column
//! 2. `convert_text` turns the textual cell the server sent into a `Value`
//!
//! Statements run over the text protocol, so every cell arrives as bytes and
//! the native type decides how those bytes are read.

use crate::models::{TypeTag, Value};
use chrono::{NaiveDate, NaiveDateTime};

// =============================================================================
// Native Types
// =============================================================================

/// MySQL `FIELD_TYPE` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    VarChar,
    Bit,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    /// A code this crate does not know about.
    Unknown(u8),
}

impl NativeType {
    /// Total mapping from the protocol code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            14 => Self::NewDate,
            15 => Self::VarChar,
            16 => Self::Bit,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Decimal => 0,
            Self::Tiny => 1,
            Self::Short => 2,
            Self::Long => 3,
            Self::Float => 4,
            Self::Double => 5,
            Self::Null => 6,
            Self::Timestamp => 7,
            Self::LongLong => 8,
            Self::Int24 => 9,
            Self::Date => 10,
            Self::Time => 11,
            Self::DateTime => 12,
            Self::Year => 13,
            Self::NewDate => 14,
            Self::VarChar => 15,
            Self::Bit => 16,
            Self::Json => 245,
            Self::NewDecimal => 246,
            Self::Enum => 247,
            Self::Set => 248,
            Self::TinyBlob => 249,
            Self::MediumBlob => 250,
            Self::LongBlob => 251,
            Self::Blob => 252,
            Self::VarString => 253,
            Self::String => 254,
            Self::Geometry => 255,
            Self::Unknown(code) => *code,
        }
    }

    /// Map a type name as reported by sqlx (`"INT UNSIGNED"`, `"VARCHAR"`, ...).
    pub fn from_type_name(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        let base = upper.trim_end_matches(" UNSIGNED");

        let native = match base {
            "BOOLEAN" | "TINYINT" => Self::Tiny,
            "SMALLINT" => Self::Short,
            "INT" | "INTEGER" => Self::Long,
            "MEDIUMINT" => Self::Int24,
            "BIGINT" => Self::LongLong,
            "FLOAT" => Self::Float,
            "DOUBLE" => Self::Double,
            "NULL" => Self::Null,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "DATETIME" => Self::DateTime,
            "YEAR" => Self::Year,
            "BIT" => Self::Bit,
            "ENUM" => Self::Enum,
            "SET" => Self::Set,
            "DECIMAL" | "NUMERIC" => Self::NewDecimal,
            "GEOMETRY" => Self::Geometry,
            "JSON" => Self::Json,
            "CHAR" | "BINARY" => Self::String,
            "VARCHAR" | "VARBINARY" => Self::VarString,
            "TINYTEXT" | "TINYBLOB" => Self::TinyBlob,
            "TEXT" | "BLOB" => Self::Blob,
            "MEDIUMTEXT" | "MEDIUMBLOB" => Self::MediumBlob,
            "LONGTEXT" | "LONGBLOB" => Self::LongBlob,
            _ => return None,
        };
        Some(native)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Tiny | Self::Short | Self::Long | Self::Int24 | Self::LongLong | Self::Year
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            Self::Date | Self::NewDate | Self::DateTime | Self::Timestamp
        )
    }
}

impl From<NativeType> for TypeTag {
    fn from(native: NativeType) -> Self {
        match native {
            NativeType::Date | NativeType::NewDate | NativeType::DateTime | NativeType::Timestamp => {
                TypeTag::Date
            }
            NativeType::Decimal | NativeType::NewDecimal => TypeTag::Numeric,
            NativeType::Float | NativeType::Double => TypeTag::Float,
            NativeType::Tiny
            | NativeType::Short
            | NativeType::Long
            | NativeType::Int24
            | NativeType::Year => TypeTag::Int,
            NativeType::LongLong => TypeTag::Long,
            _ => TypeTag::Text,
        }
    }
}

// =============================================================================
// Cell Conversion
// =============================================================================

/// Parse a MySQL date or datetime literal. Zero dates and garbage give `None`.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Convert one non-NULL text-protocol cell.
///
/// `binary` marks columns with the binary charset (BLOB, BINARY, ...), which
/// are returned as bytes untouched.
pub fn convert_text(native: NativeType, binary: bool, raw: &[u8]) -> Value {
    if binary || matches!(native, NativeType::Bit | NativeType::Geometry) {
        return Value::Bytes(raw.to_vec());
    }

    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Value::Bytes(raw.to_vec()),
    };

    if native.is_integer() {
        if let Ok(v) = text.parse::<i64>() {
            return Value::Int(v);
        }
        // Unsigned BIGINT beyond i64 keeps its exact digits
        return Value::Text(text.to_string());
    }

    if native.is_temporal() {
        return parse_datetime(text).map_or(Value::Null, Value::DateTime);
    }

    match native {
        NativeType::Float | NativeType::Double => text
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(text.to_string())),
        // DECIMAL stays exact
        _ => Value::Text(text.to_string()),
    }
}

// =============================================================================
// Column Introspection Helpers
// =============================================================================

/// Icons that are also type names.
const FIELD_ICONS: &[&str] = &["bin", "date", "datetime", "float", "int", "text", "time"];

/// Browse-tree icon for a short column type such as `varchar`.
pub fn column_icon(short_type: &str) -> &'static str {
    let lower = short_type.to_lowercase();
    if let Some(icon) = FIELD_ICONS.iter().copied().find(|icon| *icon == lower) {
        return icon;
    }
    match lower.as_str() {
        "varchar" | "char" | "tinytext" | "mediumtext" | "longtext" => "text",
        "double" | "numeric" | "decimal" => "float",
        "blob" | "mediumblob" | "longblob" => "bin",
        "timestamp" => "datetime",
        "smallint" | "mediumint" | "bigint" => "int",
        _ => "what",
    }
}

/// Readable text for the `Key` column of `SHOW COLUMNS`.
pub fn key_text(key: &str) -> &str {
    match key {
        "PRI" => "PRIMARY KEY",
        "MUL" => "INDEX",
        "UNI" => "UNIQUE",
        other => other,
    }
}

/// Declared column type split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub short_type: String,
    pub scale: Option<u32>,
    pub precision: Option<u32>,
}

/// Split `decimal(10,2)` into `decimal`, 10 and 2.
///
/// Sizes of `enum` and `set` hold their members, not numbers, and are skipped.
pub fn split_column_type(full_type: &str) -> ColumnType {
    let (Some(open), Some(close)) = (full_type.find('('), full_type.rfind(')')) else {
        return ColumnType {
            short_type: full_type.to_string(),
            scale: None,
            precision: None,
        };
    };

    let short_type = full_type[..open].to_string();
    let mut parsed = ColumnType {
        short_type,
        scale: None,
        precision: None,
    };
    if close <= open || matches!(parsed.short_type.as_str(), "enum" | "set") {
        return parsed;
    }

    let size = &full_type[open + 1..close];
    match size.split_once(',') {
        Some((scale, precision)) => {
            parsed.scale = scale.trim().parse().ok();
            parsed.precision = precision.trim().parse().ok();
        }
        None => parsed.scale = size.trim().parse().ok(),
    }
    parsed
}
