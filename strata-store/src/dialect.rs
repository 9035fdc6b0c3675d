//! Per-driver SQL templates.
//!
//! A dialect is an enum of kind plus static template strings; the engines
//! never build SQL dynamically apart from substituting validated schema
//! identifiers into the create-schema statement.

use crate::error::{Result, StoreError};

/// SQL dialect selected by the driver string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    SqlServer,
}

/// Schema identifiers must match `[A-Za-z_][A-Za-z0-9_]*`.
///
/// Tenant names end up inside DDL where parameter markers cannot be used,
/// so anything else is rejected before SQL is produced.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_owned()))
    }
}

impl Dialect {
    pub fn from_driver(driver: &str) -> Result<Self> {
        match driver {
            "postgres" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            "sqlserver" => Ok(Dialect::SqlServer),
            other => Err(StoreError::UnknownDriver(other.to_owned())),
        }
    }

    /// Idempotent create-schema statement for a validated identifier.
    pub fn create_schema_sql(&self, schema: &str) -> Result<String> {
        validate_identifier(schema)?;
        Ok(match self {
            Dialect::Postgres | Dialect::MySql => {
                format!("create schema if not exists {schema}")
            }
            Dialect::SqlServer => format!(
                r#"
if not exists (select * from information_schema.schemata where schema_name = '{schema}')
begin
  exec sp_executesql N'create schema [{schema}]'
end
"#
            ),
        })
    }

    pub fn create_migrations_table_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                r#"
create table if not exists migrator.migrator_migrations (
  id serial primary key,
  name varchar(200) not null,
  source_dir varchar(200) not null,
  filename varchar(200) not null,
  type int not null,
  db_schema varchar(200) not null,
  created timestamp with time zone default now(),
  contents text,
  checksum varchar(64)
)
"#
            }
            Dialect::MySql => {
                r#"
create table if not exists migrator.migrator_migrations (
  id int not null auto_increment primary key,
  name varchar(200) not null,
  source_dir varchar(200) not null,
  filename varchar(200) not null,
  type int not null,
  db_schema varchar(200) not null,
  created timestamp default current_timestamp,
  contents text,
  checksum varchar(64)
)
"#
            }
            Dialect::SqlServer => {
                r#"
if not exists (select * from information_schema.tables where table_schema = 'migrator' and table_name = 'migrator_migrations')
begin
  create table [migrator].migrator_migrations (
    id int identity (1,1) primary key,
    name varchar(200) not null,
    source_dir varchar(200) not null,
    filename varchar(200) not null,
    type int not null,
    db_schema varchar(200) not null,
    created datetime default current_timestamp,
    contents text,
    checksum varchar(64)
  )
end
"#
            }
        }
    }

    pub fn create_tenants_table_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                r#"
create table if not exists migrator.migrator_tenants (
  id serial primary key,
  name varchar(200) not null,
  created timestamp with time zone default now()
)
"#
            }
            Dialect::MySql => {
                r#"
create table if not exists migrator.migrator_tenants (
  id int not null auto_increment primary key,
  name varchar(200) not null,
  created timestamp default current_timestamp
)
"#
            }
            Dialect::SqlServer => {
                r#"
if not exists (select * from information_schema.tables where table_schema = 'migrator' and table_name = 'migrator_tenants')
begin
  create table [migrator].migrator_tenants (
    id int identity (1,1) primary key,
    name varchar(200) not null,
    created datetime default current_timestamp
  )
end
"#
            }
        }
    }

    /// Versions bootstrap: create the table, add the `version_id` column to
    /// the migrations table when missing, and link any pre-existing
    /// migrations to a back-filled `Initial version` row.
    ///
    /// Statements must run in order on one connection.
    pub fn create_versions_table_sql(&self) -> Vec<&'static str> {
        match self {
            Dialect::Postgres => vec![
                r#"
do $$
begin
  if not exists (select 1 from information_schema.tables where table_schema = 'migrator' and table_name = 'migrator_versions') then
    create table migrator.migrator_versions (
      id serial primary key,
      name varchar(200) not null,
      created timestamp with time zone default now()
    );
    alter table migrator.migrator_migrations add column version_id integer;
    create index migrator_migrations_version_id_idx on migrator.migrator_migrations (version_id);
    if exists (select 1 from migrator.migrator_migrations) then
      insert into migrator.migrator_versions (name) values ('Initial version');
      update migrator.migrator_migrations set version_id = (select max(id) from migrator.migrator_versions);
    end if;
    alter table migrator.migrator_migrations alter column version_id set not null;
    alter table migrator.migrator_migrations add constraint migrator_migrations_version_id_fk foreign key (version_id) references migrator.migrator_versions (id) on delete cascade;
  end if;
end $$
"#,
            ],
            Dialect::MySql => vec![
                r#"
create table if not exists migrator.migrator_versions (
  id int not null auto_increment primary key,
  name varchar(200) not null,
  created timestamp default current_timestamp
)
"#,
                "set @version_id_missing := (select count(*) = 0 from information_schema.columns where table_schema = 'migrator' and table_name = 'migrator_migrations' and column_name = 'version_id')",
                "set @ddl := if(@version_id_missing, 'alter table migrator.migrator_migrations add column version_id int, add index migrator_migrations_version_id_idx (version_id)', 'select 1')",
                "prepare version_id_stmt from @ddl",
                "execute version_id_stmt",
                "deallocate prepare version_id_stmt",
                "insert into migrator.migrator_versions (name) select 'Initial version' from dual where exists (select 1 from migrator.migrator_migrations where version_id is null) and not exists (select 1 from migrator.migrator_versions)",
                "update migrator.migrator_migrations set version_id = (select max(id) from migrator.migrator_versions) where version_id is null",
                "set @fk_missing := (select count(*) = 0 from information_schema.table_constraints where table_schema = 'migrator' and table_name = 'migrator_migrations' and constraint_name = 'migrator_migrations_version_id_fk')",
                "set @ddl := if(@fk_missing, 'alter table migrator.migrator_migrations add constraint migrator_migrations_version_id_fk foreign key (version_id) references migrator.migrator_versions (id) on delete cascade', 'select 1')",
                "prepare version_id_fk_stmt from @ddl",
                "execute version_id_fk_stmt",
                "deallocate prepare version_id_fk_stmt",
            ],
            Dialect::SqlServer => vec![
                r#"
if not exists (select * from information_schema.tables where table_schema = 'migrator' and table_name = 'migrator_versions')
begin
  create table [migrator].migrator_versions (
    id int identity (1,1) primary key,
    name varchar(200) not null,
    created datetime default current_timestamp
  )
end
"#,
                r#"
if not exists (select * from information_schema.columns where table_schema = 'migrator' and table_name = 'migrator_migrations' and column_name = 'version_id')
begin
  alter table [migrator].migrator_migrations add version_id int
  exec sp_executesql N'create index migrator_migrations_version_id_idx on [migrator].migrator_migrations (version_id)'
end
"#,
                r#"
if exists (select * from [migrator].migrator_migrations where version_id is null) and not exists (select * from [migrator].migrator_versions)
begin
  insert into [migrator].migrator_versions (name) values ('Initial version')
end
"#,
                "update [migrator].migrator_migrations set version_id = (select max(id) from [migrator].migrator_versions) where version_id is null",
                r#"
if not exists (select * from information_schema.referential_constraints where constraint_schema = 'migrator' and constraint_name = 'migrator_migrations_version_id_fk')
begin
  alter table [migrator].migrator_migrations add constraint migrator_migrations_version_id_fk foreign key (version_id) references [migrator].migrator_versions (id) on delete cascade
end
"#,
            ],
        }
    }

    pub fn migration_insert_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "insert into migrator.migrator_migrations (name, source_dir, filename, type, db_schema, contents, checksum, version_id) values ($1, $2, $3, $4, $5, $6, $7, $8)",
            Dialect::MySql => "insert into migrator.migrator_migrations (name, source_dir, filename, type, db_schema, contents, checksum, version_id) values (?, ?, ?, ?, ?, ?, ?, ?)",
            Dialect::SqlServer => "insert into [migrator].migrator_migrations (name, source_dir, filename, type, db_schema, contents, checksum, version_id) values (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8)",
        }
    }

    pub fn tenant_insert_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "insert into migrator.migrator_tenants (name) values ($1)",
            Dialect::MySql => "insert into migrator.migrator_tenants (name) values (?)",
            Dialect::SqlServer => "insert into [migrator].migrator_tenants (name) values (@P1)",
        }
    }

    pub fn version_insert_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "insert into migrator.migrator_versions (name) values ($1) returning id"
            }
            Dialect::MySql => "insert into migrator.migrator_versions (name) values (?)",
            Dialect::SqlServer => {
                "insert into [migrator].migrator_versions (name) output inserted.id values (@P1)"
            }
        }
    }

    /// True when the insert does not return the new id itself and the
    /// engine must follow up with [`Dialect::last_insert_id_sql`].
    pub fn last_insert_id_supported(&self) -> bool {
        matches!(self, Dialect::MySql)
    }

    pub fn last_insert_id_sql(&self) -> &'static str {
        "select cast(last_insert_id() as signed)"
    }

    pub fn tenant_select_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::MySql => "select name from migrator.migrator_tenants",
            Dialect::SqlServer => "select name from [migrator].migrator_tenants",
        }
    }

    /// Applied history ordered by `(name, source_dir)`.
    pub fn migration_select_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::MySql => "select id, name, source_dir, filename, type, db_schema, created, contents, checksum, version_id from migrator.migrator_migrations order by name, source_dir",
            Dialect::SqlServer => "select id, name, source_dir, filename, type, db_schema, created, contents, checksum, version_id from [migrator].migrator_migrations order by name, source_dir",
        }
    }

    pub fn migration_by_id_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "select id, name, source_dir, filename, type, db_schema, created, contents, checksum, version_id from migrator.migrator_migrations where id = $1",
            Dialect::MySql => "select id, name, source_dir, filename, type, db_schema, created, contents, checksum, version_id from migrator.migrator_migrations where id = ?",
            Dialect::SqlServer => "select id, name, source_dir, filename, type, db_schema, created, contents, checksum, version_id from [migrator].migrator_migrations where id = @P1",
        }
    }

    /// Version queries LEFT JOIN migrations and repeat the version columns
    /// on every row; the engine collapses the rows back into versions.
    pub fn versions_select_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::MySql => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from migrator.migrator_versions mv left join migrator.migrator_migrations mm on mv.id = mm.version_id order by mv.id desc, mm.id asc",
            Dialect::SqlServer => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from [migrator].migrator_versions mv left join [migrator].migrator_migrations mm on mv.id = mm.version_id order by mv.id desc, mm.id asc",
        }
    }

    pub fn version_by_id_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from migrator.migrator_versions mv left join migrator.migrator_migrations mm on mv.id = mm.version_id where mv.id = $1 order by mm.id asc",
            Dialect::MySql => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from migrator.migrator_versions mv left join migrator.migrator_migrations mm on mv.id = mm.version_id where mv.id = ? order by mm.id asc",
            Dialect::SqlServer => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from [migrator].migrator_versions mv left join [migrator].migrator_migrations mm on mv.id = mm.version_id where mv.id = @P1 order by mm.id asc",
        }
    }

    pub fn versions_by_file_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from migrator.migrator_versions mv left join migrator.migrator_migrations mm on mv.id = mm.version_id where mv.id in (select version_id from migrator.migrator_migrations where filename = $1) order by mv.id desc, mm.id asc",
            Dialect::MySql => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from migrator.migrator_versions mv left join migrator.migrator_migrations mm on mv.id = mm.version_id where mv.id in (select version_id from migrator.migrator_migrations where filename = ?) order by mv.id desc, mm.id asc",
            Dialect::SqlServer => "select mv.id, mv.name, mv.created, mm.id, mm.name, mm.source_dir, mm.filename, mm.type, mm.db_schema, mm.created, mm.contents, mm.checksum, mm.version_id from [migrator].migrator_versions mv left join [migrator].migrator_migrations mm on mv.id = mm.version_id where mv.id in (select version_id from [migrator].migrator_migrations where filename = @P1) order by mv.id desc, mm.id asc",
        }
    }
}
