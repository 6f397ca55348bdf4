//! Table layout owned by the bridge inside the host database.

/// Registry of metamodels installed on a host database, one row per metamodel.
pub const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metamodel_registry (
    name            VARCHAR PRIMARY KEY,
    version         BIGINT NOT NULL
);
"#;

/// The adapter's tables, keyed throughout by generator id.
pub const ADAPTER_SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS loom_generator (
    generator_id    BIGINT NOT NULL,
    name            VARCHAR NOT NULL,
    project_path    VARCHAR NOT NULL,
    PRIMARY KEY (generator_id)
);

CREATE TABLE IF NOT EXISTS loom_generator_model_info (
    generator_id    BIGINT NOT NULL,
    num_models      BIGINT NOT NULL,
    PRIMARY KEY (generator_id)
);

CREATE TABLE IF NOT EXISTS loom_string_encoding (
    generator_id    BIGINT NOT NULL,
    colno           BIGINT NOT NULL,
    string_form     VARCHAR NOT NULL,
    integer_form    BIGINT NOT NULL,
    PRIMARY KEY (generator_id, colno, integer_form)
);

CREATE TABLE IF NOT EXISTS loom_column_ordering (
    generator_id    BIGINT NOT NULL,
    colno           BIGINT NOT NULL,
    col_rank        BIGINT NOT NULL,
    PRIMARY KEY (generator_id, colno)
);

CREATE TABLE IF NOT EXISTS loom_column_kind_partition (
    generator_id    BIGINT NOT NULL,
    modelno         BIGINT NOT NULL,
    colno           BIGINT NOT NULL,
    kind_id         BIGINT NOT NULL,
    PRIMARY KEY (generator_id, modelno, colno)
);

CREATE TABLE IF NOT EXISTS loom_row_kind_partition (
    generator_id    BIGINT NOT NULL,
    modelno         BIGINT NOT NULL,
    rowid           BIGINT NOT NULL,
    kind_id         BIGINT NOT NULL,
    partition_id    BIGINT NOT NULL,
    PRIMARY KEY (generator_id, modelno, rowid, kind_id)
);
"#;

/// Every table whose rows are scoped to a generator.
pub const GENERATOR_TABLES: [&str; 6] = [
    "loom_generator",
    "loom_generator_model_info",
    "loom_string_encoding",
    "loom_column_ordering",
    "loom_column_kind_partition",
    "loom_row_kind_partition",
];

/// Tables derived from trained models.
pub const PARTITION_TABLES: [&str; 2] = ["loom_column_kind_partition", "loom_row_kind_partition"];
