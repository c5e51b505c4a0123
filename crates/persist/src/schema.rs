//! Versioned schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

use keel_core::StoreError;

use crate::sql_err;

/// Applied in order; index + 1 is the resulting `user_version`.
const MIGRATIONS: &[&str] = &[
    // 1: namespaces, volumes, accesses
    "CREATE TABLE namespaces (
        id               TEXT PRIMARY KEY,
        owner            TEXT NOT NULL,
        label            TEXT NOT NULL,
        cpu              INTEGER NOT NULL,
        ram              INTEGER NOT NULL,
        max_ext_services INTEGER NOT NULL,
        max_int_services INTEGER NOT NULL,
        max_traffic      INTEGER NOT NULL,
        tariff_id        TEXT,
        created_at       INTEGER NOT NULL,
        deleted          INTEGER NOT NULL DEFAULT 0,
        delete_time      INTEGER
    );
    CREATE UNIQUE INDEX ux_namespaces_owner_label ON namespaces(owner, label) WHERE deleted = 0;

    CREATE TABLE volumes (
        id          TEXT PRIMARY KEY,
        owner       TEXT NOT NULL,
        label       TEXT NOT NULL,
        capacity    INTEGER NOT NULL,
        replicas    INTEGER NOT NULL,
        persistent  INTEGER NOT NULL,
        created_at  INTEGER NOT NULL,
        deleted     INTEGER NOT NULL DEFAULT 0,
        delete_time INTEGER
    );
    CREATE UNIQUE INDEX ux_volumes_owner_label ON volumes(owner, label) WHERE deleted = 0;

    CREATE TABLE namespace_volumes (
        namespace_id TEXT NOT NULL REFERENCES namespaces(id),
        volume_id    TEXT NOT NULL REFERENCES volumes(id),
        PRIMARY KEY (namespace_id, volume_id)
    );

    CREATE TABLE accesses (
        id               TEXT PRIMARY KEY,
        kind             TEXT NOT NULL,
        resource_id      TEXT NOT NULL,
        resource_label   TEXT NOT NULL,
        subject          TEXT NOT NULL,
        owner            TEXT NOT NULL,
        access_level     INTEGER NOT NULL,
        new_access_level INTEGER NOT NULL,
        limited          INTEGER NOT NULL DEFAULT 0,
        changed_at       INTEGER NOT NULL,
        UNIQUE (kind, resource_id, subject),
        UNIQUE (subject, kind, resource_label)
    );
    CREATE INDEX ix_accesses_owner ON accesses(owner, kind);",
    // 2: deployments and their versions
    "CREATE TABLE deployments (
        id           TEXT PRIMARY KEY,
        namespace_id TEXT NOT NULL REFERENCES namespaces(id),
        name         TEXT NOT NULL,
        owner        TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        deleted      INTEGER NOT NULL DEFAULT 0,
        delete_time  INTEGER
    );
    CREATE UNIQUE INDEX ux_deployments_ns_name ON deployments(namespace_id, name) WHERE deleted = 0;

    CREATE TABLE versions (
        id            TEXT PRIMARY KEY,
        deployment_id TEXT NOT NULL REFERENCES deployments(id),
        major         INTEGER NOT NULL,
        minor         INTEGER NOT NULL,
        patch         INTEGER NOT NULL,
        spec          TEXT NOT NULL,
        active        INTEGER NOT NULL DEFAULT 0,
        created_at    INTEGER NOT NULL,
        UNIQUE (deployment_id, major, minor, patch)
    );
    CREATE UNIQUE INDEX ux_versions_one_active ON versions(deployment_id) WHERE active = 1;",
    // 3: domain pool and ingresses
    "CREATE TABLE domains (
        id     TEXT PRIMARY KEY,
        domain TEXT NOT NULL UNIQUE,
        grp    TEXT NOT NULL,
        ips    TEXT NOT NULL
    );

    CREATE TABLE ingresses (
        id           TEXT PRIMARY KEY,
        namespace_id TEXT NOT NULL REFERENCES namespaces(id),
        name         TEXT NOT NULL,
        domain       TEXT NOT NULL,
        path         TEXT NOT NULL,
        service_name TEXT NOT NULL,
        service_port INTEGER NOT NULL,
        tls          INTEGER NOT NULL,
        owner        TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        deleted      INTEGER NOT NULL DEFAULT 0,
        delete_time  INTEGER
    );
    CREATE UNIQUE INDEX ux_ingresses_domain_path ON ingresses(domain, path) WHERE deleted = 0;
    CREATE UNIQUE INDEX ux_ingresses_ns_name ON ingresses(namespace_id, name) WHERE deleted = 0;",
    // 4: per-owner ceilings that outlive the owner's resources
    "CREATE TABLE owner_ceilings (
        owner      TEXT NOT NULL,
        kind       TEXT NOT NULL,
        ceiling    INTEGER NOT NULL,
        changed_at INTEGER NOT NULL,
        PRIMARY KEY (owner, kind)
    );
    INSERT INTO owner_ceilings (owner, kind, ceiling, changed_at)
        SELECT owner, kind, MIN(new_access_level), MAX(changed_at) FROM accesses
        WHERE subject = owner AND new_access_level < 3
        GROUP BY owner, kind;",
];

pub(crate) fn latest() -> i64 {
    MIGRATIONS.len() as i64
}

pub(crate) fn migrate(db: &mut Connection) -> Result<i64, StoreError> {
    let current: i64 = db
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .map_err(sql_err)?;
    for (idx, ddl) in MIGRATIONS.iter().enumerate().skip(current.max(0) as usize) {
        let target = idx as i64 + 1;
        let tx = db.transaction().map_err(|e| StoreError::Begin(e.to_string()))?;
        tx.execute_batch(ddl).map_err(sql_err)?;
        // PRAGMA does not take bound parameters.
        tx.execute_batch(&format!("PRAGMA user_version = {}", target)).map_err(sql_err)?;
        tx.commit().map_err(|e| StoreError::Commit(e.to_string()))?;
        info!(version = target, "persist: applied migration");
    }
    Ok(latest())
}
