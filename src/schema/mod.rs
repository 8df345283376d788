pub mod evolution;

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    fs::{retry_read, FileIO},
    options::CoreOptions,
    types::DataType,
};

/// A column with a stable id. Ids never change across evolution; names may.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DataField {
    pub fn new(id: i32, name: impl Into<String>, data_type: DataType) -> Self {
        DataField {
            id,
            name: name.into(),
            data_type,
            nullable: true,
            description: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// An ordered list of fields describing one row shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowType(pub Vec<DataField>);

impl RowType {
    pub fn new(fields: Vec<DataField>) -> Self {
        RowType(fields)
    }

    pub fn fields(&self) -> &[DataField] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.0.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|f| f.name == name)
    }

    pub fn field_ids(&self) -> Vec<i32> {
        self.0.iter().map(|f| f.id).collect()
    }

    pub fn project(&self, indexes: &[usize]) -> RowType {
        RowType(indexes.iter().map(|i| self.0[*i].clone()).collect())
    }
}

/// A column definition before ids are assigned.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub description: Option<String>,
}

pub fn column(name: impl Into<String>, data_type: DataType) -> ColumnDef {
    ColumnDef {
        name: name.into(),
        data_type,
        nullable: true,
        description: None,
    }
}

/// User-facing table definition handed to [`SchemaManager::create_table`].
#[derive(Debug, Clone, Default)]
pub struct TableDefinition {
    pub columns: Vec<ColumnDef>,
    pub partition_keys: Vec<String>,
    pub primary_keys: Vec<String>,
    pub options: HashMap<String, String>,
    pub comment: Option<String>,
}

/// A versioned, persisted table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub id: i64,
    pub fields: Vec<DataField>,
    pub highest_field_id: i32,
    pub partition_keys: Vec<String>,
    pub primary_keys: Vec<String>,
    pub options: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl TableSchema {
    pub fn core_options(&self) -> Result<CoreOptions> {
        CoreOptions::from_map(self.options.clone())
    }

    pub fn row_type(&self) -> RowType {
        RowType(self.fields.clone())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn has_primary_keys(&self) -> bool {
        !self.primary_keys.is_empty()
    }

    /// Primary key fields minus partition fields; the LSM key of a bucket.
    pub fn trimmed_primary_keys(&self) -> Vec<String> {
        self.primary_keys
            .iter()
            .filter(|k| !self.partition_keys.contains(k))
            .cloned()
            .collect()
    }

    pub fn partition_type(&self) -> RowType {
        self.projected_type(&self.partition_keys)
    }

    pub fn key_type(&self) -> RowType {
        self.projected_type(&self.trimmed_primary_keys())
    }

    pub fn projected_type(&self, names: &[String]) -> RowType {
        RowType(
            names
                .iter()
                .map(|name| {
                    self.fields
                        .iter()
                        .find(|f| &f.name == name)
                        .expect("projected field must exist")
                        .clone()
                })
                .collect(),
        )
    }

    pub fn field_indexes(&self, names: &[String]) -> Vec<usize> {
        names
            .iter()
            .map(|name| self.field_index(name).expect("field must exist"))
            .collect()
    }

    /// Fields the bucket is routed by: the configured `bucket-key`, else
    /// the trimmed primary keys, else (append-only) the whole row.
    pub fn bucket_key_fields(&self, options: &CoreOptions) -> Vec<String> {
        if !options.bucket_key.is_empty() {
            return options.bucket_key.clone();
        }
        let trimmed = self.trimmed_primary_keys();
        if !trimmed.is_empty() {
            return trimmed;
        }
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// A single schema evolution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaChange {
    AddColumn {
        name: String,
        data_type: DataType,
        nullable: bool,
        description: Option<String>,
    },
    DropColumn {
        name: String,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
    },
    UpdateColumnType {
        name: String,
        new_type: DataType,
    },
    SetOption {
        key: String,
        value: String,
    },
    RemoveOption {
        key: String,
    },
}

/// Options that must not change after table creation.
const IMMUTABLE_OPTIONS: &[&str] = &["bucket", "bucket-key", "merge-engine", "sequence.field"];

const SCHEMA_PREFIX: &str = "schema-";

/// Append-only store of schema files under `<table>/schema/schema-<id>`.
pub struct SchemaManager {
    file_io: Arc<dyn FileIO>,
    table_root: PathBuf,
}

impl SchemaManager {
    pub fn new(file_io: Arc<dyn FileIO>, table_root: impl Into<PathBuf>) -> Self {
        SchemaManager {
            file_io,
            table_root: table_root.into(),
        }
    }

    fn schema_dir(&self) -> PathBuf {
        self.table_root.join("schema")
    }

    pub fn schema_path(&self, id: i64) -> PathBuf {
        self.schema_dir().join(format!("{SCHEMA_PREFIX}{id}"))
    }

    pub fn schema_exists(&self, id: i64) -> Result<bool> {
        self.file_io.exists(&self.schema_path(id))
    }

    pub fn schema(&self, id: i64) -> Result<TableSchema> {
        let path = self.schema_path(id);
        let text = retry_read(|| self.file_io.read_to_string(&path))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn list_all_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .file_io
            .list_status(&self.schema_dir())?
            .into_iter()
            .filter_map(|status| parse_numbered_file(&status.path, SCHEMA_PREFIX))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn list_all(&self) -> Result<Vec<TableSchema>> {
        self.list_all_ids()?
            .into_iter()
            .map(|id| self.schema(id))
            .collect()
    }

    pub fn latest(&self) -> Result<Option<TableSchema>> {
        match self.list_all_ids()?.last() {
            Some(id) => Ok(Some(self.schema(*id)?)),
            None => Ok(None),
        }
    }

    /// Write schema 0. Fails when the table already has a schema.
    pub fn create_table(&self, definition: TableDefinition) -> Result<TableSchema> {
        let mut fields = Vec::with_capacity(definition.columns.len());
        for (id, col) in definition.columns.iter().enumerate() {
            fields.push(DataField {
                id: id as i32,
                name: col.name.clone(),
                data_type: col.data_type,
                nullable: col.nullable,
                description: col.description.clone(),
            });
        }
        let schema = TableSchema {
            id: 0,
            highest_field_id: fields.len() as i32 - 1,
            fields,
            partition_keys: definition.partition_keys,
            primary_keys: definition.primary_keys,
            options: definition.options,
            comment: definition.comment,
        };
        validate(&schema)?;

        let content = serde_json::to_vec_pretty(&schema)?;
        if !self
            .file_io
            .try_atomic_write(&self.schema_path(0), &content)?
        {
            return Err(Error::ConflictFatal(format!(
                "table at {} already exists",
                self.table_root.display()
            )));
        }
        info!(table = %self.table_root.display(), "created table schema 0");
        Ok(schema)
    }

    /// Apply `changes` on top of the latest schema, producing schema
    /// `id + 1`. Retries when racing another schema committer.
    pub fn commit_changes(&self, changes: Vec<SchemaChange>) -> Result<TableSchema> {
        loop {
            let base = self.latest()?.ok_or_else(|| {
                Error::IoFatal(format!("no schema found under {}", self.table_root.display()))
            })?;
            let new_schema = apply_changes(&base, &changes)?;
            let content = serde_json::to_vec_pretty(&new_schema)?;
            if self
                .file_io
                .try_atomic_write(&self.schema_path(new_schema.id), &content)?
            {
                info!(schema_id = new_schema.id, "committed schema change");
                return Ok(new_schema);
            }
            // lost the race, rebase onto the newer schema
        }
    }
}

fn apply_changes(base: &TableSchema, changes: &[SchemaChange]) -> Result<TableSchema> {
    let mut schema = base.clone();
    schema.id += 1;
    let protected: HashSet<&String> = schema
        .partition_keys
        .iter()
        .chain(schema.primary_keys.iter())
        .collect();

    for change in changes {
        match change {
            SchemaChange::AddColumn {
                name,
                data_type,
                nullable,
                description,
            } => {
                if schema.fields.iter().any(|f| &f.name == name) {
                    return Err(Error::SchemaMismatch(format!(
                        "column '{name}' already exists"
                    )));
                }
                schema.highest_field_id += 1;
                schema.fields.push(DataField {
                    id: schema.highest_field_id,
                    name: name.clone(),
                    data_type: *data_type,
                    nullable: *nullable,
                    description: description.clone(),
                });
            }
            SchemaChange::DropColumn { name } => {
                if protected.contains(name) {
                    return Err(Error::SchemaMismatch(format!(
                        "cannot drop primary key or partition column '{name}'"
                    )));
                }
                let before = schema.fields.len();
                schema.fields.retain(|f| &f.name != name);
                if schema.fields.len() == before {
                    return Err(Error::SchemaMismatch(format!("no such column '{name}'")));
                }
            }
            SchemaChange::RenameColumn { old_name, new_name } => {
                if protected.contains(old_name) {
                    return Err(Error::SchemaMismatch(format!(
                        "cannot rename primary key or partition column '{old_name}'"
                    )));
                }
                if schema.fields.iter().any(|f| &f.name == new_name) {
                    return Err(Error::SchemaMismatch(format!(
                        "column '{new_name}' already exists"
                    )));
                }
                let field = schema
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == old_name)
                    .ok_or_else(|| Error::SchemaMismatch(format!("no such column '{old_name}'")))?;
                field.name = new_name.clone();
            }
            SchemaChange::UpdateColumnType { name, new_type } => {
                if protected.contains(name) {
                    return Err(Error::SchemaMismatch(format!(
                        "cannot retype primary key or partition column '{name}'"
                    )));
                }
                let field = schema
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == name)
                    .ok_or_else(|| Error::SchemaMismatch(format!("no such column '{name}'")))?;
                if !field.data_type.can_widen_to(*new_type) {
                    return Err(Error::SchemaMismatch(format!(
                        "cannot change column '{name}' from {} to {}",
                        field.data_type, new_type
                    )));
                }
                field.data_type = *new_type;
            }
            SchemaChange::SetOption { key, value } => {
                if IMMUTABLE_OPTIONS.contains(&key.as_str()) {
                    return Err(Error::ConfigInvalid(format!(
                        "option '{key}' cannot be changed after table creation"
                    )));
                }
                schema.options.insert(key.clone(), value.clone());
            }
            SchemaChange::RemoveOption { key } => {
                if IMMUTABLE_OPTIONS.contains(&key.as_str()) {
                    return Err(Error::ConfigInvalid(format!(
                        "option '{key}' cannot be changed after table creation"
                    )));
                }
                schema.options.remove(key);
            }
        }
    }
    validate(&schema)?;
    Ok(schema)
}

fn validate(schema: &TableSchema) -> Result<()> {
    let mut seen = HashSet::new();
    for field in &schema.fields {
        if !seen.insert(&field.name) {
            return Err(Error::ConfigInvalid(format!(
                "duplicate column name '{}'",
                field.name
            )));
        }
    }
    let names: HashSet<&String> = schema.fields.iter().map(|f| &f.name).collect();
    for key in schema.partition_keys.iter().chain(&schema.primary_keys) {
        if !names.contains(key) {
            return Err(Error::ConfigInvalid(format!(
                "key column '{key}' is not a table column"
            )));
        }
    }
    if schema.has_primary_keys() {
        for partition_key in &schema.partition_keys {
            if !schema.primary_keys.contains(partition_key) {
                return Err(Error::ConfigInvalid(format!(
                    "primary keys must contain partition key '{partition_key}'"
                )));
            }
        }
        if schema.trimmed_primary_keys().is_empty() {
            return Err(Error::ConfigInvalid(
                "primary keys must not be exactly the partition keys".to_string(),
            ));
        }
        for pk in &schema.primary_keys {
            let field = schema.fields.iter().find(|f| &f.name == pk).expect("checked");
            if field.nullable {
                return Err(Error::ConfigInvalid(format!(
                    "primary key column '{pk}' must not be nullable"
                )));
            }
        }
    }

    // option-level checks that need the schema
    let options = schema.core_options()?;
    for name in &options.bucket_key {
        if !names.contains(name) {
            return Err(Error::ConfigInvalid(format!(
                "bucket-key column '{name}' is not a table column"
            )));
        }
        if schema.has_primary_keys() && !schema.trimmed_primary_keys().contains(name) {
            return Err(Error::ConfigInvalid(format!(
                "bucket-key column '{name}' must be part of the non-partition primary keys"
            )));
        }
    }
    if let Some(sequence_field) = &options.sequence_field {
        let field = schema
            .fields
            .iter()
            .find(|f| &f.name == sequence_field)
            .ok_or_else(|| {
                Error::ConfigInvalid(format!(
                    "sequence.field column '{sequence_field}' is not a table column"
                ))
            })?;
        if !matches!(
            field.data_type,
            DataType::Int | DataType::BigInt | DataType::Timestamp
        ) {
            return Err(Error::ConfigInvalid(format!(
                "sequence.field column '{sequence_field}' must be an integer or timestamp"
            )));
        }
    }
    Ok(())
}

/// Parse `<prefix><n>` file names; used for schema and snapshot listings.
pub(crate) fn parse_numbered_file(path: &Path, prefix: &str) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(prefix)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::local::LocalFileIO;

    fn manager(dir: &Path) -> SchemaManager {
        SchemaManager::new(Arc::new(LocalFileIO::new()), dir)
    }

    fn pk_definition() -> TableDefinition {
        TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::BigInt)
                },
                column("v", DataType::BigInt),
            ],
            primary_keys: vec!["k".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let created = manager.create_table(pk_definition()).unwrap();
        assert_eq!(created.id, 0);
        assert_eq!(created.highest_field_id, 1);

        let loaded = manager.latest().unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(manager.create_table(pk_definition()).is_err());
    }

    #[test]
    fn evolution_assigns_fresh_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.create_table(pk_definition()).unwrap();

        let v1 = manager
            .commit_changes(vec![SchemaChange::AddColumn {
                name: "w".to_string(),
                data_type: DataType::String,
                nullable: true,
                description: None,
            }])
            .unwrap();
        assert_eq!(v1.id, 1);
        assert_eq!(v1.fields[2].id, 2);

        // dropping and re-adding must not reuse the id
        let v2 = manager
            .commit_changes(vec![
                SchemaChange::DropColumn {
                    name: "w".to_string(),
                },
                SchemaChange::AddColumn {
                    name: "w".to_string(),
                    data_type: DataType::String,
                    nullable: true,
                    description: None,
                },
            ])
            .unwrap();
        assert_eq!(v2.fields[2].id, 3);
        assert_eq!(manager.list_all_ids().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn primary_key_columns_are_protected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.create_table(pk_definition()).unwrap();
        assert!(manager
            .commit_changes(vec![SchemaChange::DropColumn {
                name: "k".to_string()
            }])
            .is_err());
        assert!(manager
            .commit_changes(vec![SchemaChange::SetOption {
                key: "bucket".to_string(),
                value: "4".to_string()
            }])
            .is_err());
    }

    #[test]
    fn retype_must_widen() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.create_table(pk_definition()).unwrap();
        assert!(manager
            .commit_changes(vec![SchemaChange::UpdateColumnType {
                name: "v".to_string(),
                new_type: DataType::Double,
            }])
            .is_ok());
        assert!(manager
            .commit_changes(vec![SchemaChange::UpdateColumnType {
                name: "v".to_string(),
                new_type: DataType::Int,
            }])
            .is_err());
    }

    #[test]
    fn pk_must_cover_partition_keys() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let definition = TableDefinition {
            columns: vec![
                ColumnDef {
                    nullable: false,
                    ..column("dt", DataType::String)
                },
                ColumnDef {
                    nullable: false,
                    ..column("k", DataType::BigInt)
                },
                column("v", DataType::BigInt),
            ],
            partition_keys: vec!["dt".to_string()],
            primary_keys: vec!["k".to_string()],
            ..Default::default()
        };
        assert!(manager.create_table(definition).is_err());
    }
}
