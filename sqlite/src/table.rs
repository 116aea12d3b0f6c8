//! Table descriptors for row-level writes.
//!
//! A [`Table`] builds `INSERT`, `UPDATE` and `DELETE` statements at runtime
//! from JSON objects and returns the affected row as a JSON object through
//! `RETURNING *`. Table and column names are restricted to plain SQL
//! identifiers; values are always bound as parameters.

use crate::database_error;
use serde_json::{Map, Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqliteConnection, TypeInfo, ValueRef};
use wiz_kernel_core::{KernelError, KernelResult};

/// A table addressed by a single id column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    id_column: String,
}

impl Table {
    /// Describe `name` with an `id` primary key column.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Validation`] if `name` is not a plain identifier.
    pub fn new(name: impl Into<String>) -> KernelResult<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self {
            name,
            id_column: "id".to_owned(),
        })
    }

    /// Use a different id column.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Validation`] if `column` is not a plain identifier.
    pub fn with_id_column(mut self, column: impl Into<String>) -> KernelResult<Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.id_column = column;
        Ok(self)
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id column name.
    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Insert `entity` and return the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Validation`] for invalid column names and
    /// [`KernelError::Database`] when the statement fails.
    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        entity: &Map<String, Value>,
    ) -> KernelResult<Value> {
        let sql = if entity.is_empty() {
            format!("INSERT INTO \"{}\" DEFAULT VALUES RETURNING *", self.name)
        } else {
            let columns = quoted_columns(entity)?;
            let placeholders = vec!["?"; entity.len()].join(", ");
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({placeholders}) RETURNING *",
                self.name,
                columns.join(", ")
            )
        };

        let query = entity.values().fold(sqlx::query(&sql), bind_json);
        let row = query.fetch_one(&mut *conn).await.map_err(database_error)?;
        row_to_json(&row)
    }

    /// Apply `changes` to the row with the given id.
    ///
    /// Returns the updated row, or `Value::Null` when no row matched.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Validation`] for an empty change set or invalid
    /// column names and [`KernelError::Database`] when the statement fails.
    pub async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        changes: &Map<String, Value>,
    ) -> KernelResult<Value> {
        if changes.is_empty() {
            return Err(KernelError::validation(format!(
                "No columns to update in {}",
                self.name
            )));
        }
        let assignments: Vec<String> = quoted_columns(changes)?
            .into_iter()
            .map(|column| format!("{column} = ?"))
            .collect();
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ? RETURNING *",
            self.name,
            assignments.join(", "),
            self.id_column
        );

        let query = changes
            .values()
            .fold(sqlx::query(&sql), bind_json)
            .bind(id.to_owned());
        let row = query
            .fetch_optional(&mut *conn)
            .await
            .map_err(database_error)?;
        row.as_ref().map_or(Ok(Value::Null), row_to_json)
    }

    /// Delete the row with the given id.
    ///
    /// Returns the deleted row, or `Value::Null` when no row matched.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Database`] when the statement fails.
    pub async fn delete(&self, conn: &mut SqliteConnection, id: &str) -> KernelResult<Value> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = ? RETURNING *",
            self.name, self.id_column
        );
        let row = sqlx::query(&sql)
            .bind(id.to_owned())
            .fetch_optional(&mut *conn)
            .await
            .map_err(database_error)?;
        row.as_ref().map_or(Ok(Value::Null), row_to_json)
    }
}

fn validate_identifier(name: &str) -> KernelResult<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KernelError::validation(format!(
            "Invalid SQL identifier: {name:?}"
        )))
    }
}

fn quoted_columns(values: &Map<String, Value>) -> KernelResult<Vec<String>> {
    values
        .keys()
        .map(|column| {
            validate_identifier(column)?;
            Ok(format!("\"{column}\""))
        })
        .collect()
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_json<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => query.bind(integer),
            None => query.bind(number.as_f64()),
        },
        Value::String(text) => query.bind(text.clone()),
        // Nested values are stored as JSON text.
        Value::Array(_) | Value::Object(_) => query.bind(value.to_string()),
    }
}

fn row_to_json(row: &SqliteRow) -> KernelResult<Value> {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(database_error)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_owned();
            decode_column(row, index, &storage)?
        };
        object.insert(column.name().to_owned(), value);
    }
    Ok(Value::Object(object))
}

fn decode_column(row: &SqliteRow, index: usize, storage: &str) -> KernelResult<Value> {
    let value = match storage {
        "INTEGER" | "NUMERIC" => Value::from(
            row.try_get_unchecked::<i64, _>(index)
                .map_err(database_error)?,
        ),
        "REAL" => Number::from_f64(
            row.try_get_unchecked::<f64, _>(index)
                .map_err(database_error)?,
        )
        .map_or(Value::Null, Value::Number),
        "BOOLEAN" => Value::Bool(
            row.try_get_unchecked::<bool, _>(index)
                .map_err(database_error)?,
        ),
        "BLOB" => Value::from(
            row.try_get_unchecked::<Vec<u8>, _>(index)
                .map_err(database_error)?,
        ),
        _ => Value::String(
            row.try_get_unchecked::<String, _>(index)
                .map_err(database_error)?,
        ),
    };
    Ok(value)
}
