//! Typed row access inside one open transaction.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::FromSql;
use rusqlite::{params, Connection, Params, Row};
use tracing::debug;
use uuid::Uuid;

use keel_core::{
    AccessLevel, AccessRecord, Deployment, DeploymentSpec, Domain, Ingress, Limits, Namespace, ResourceCounts,
    ResourceId, ResourceKind, SemVer, StoreError, UserId, Version, Volume,
};

use crate::sql_err;

const NS_COLS: &str = "id, owner, label, cpu, ram, max_ext_services, max_int_services, max_traffic, tariff_id, created_at, deleted, delete_time";
const VOL_COLS: &str = "id, owner, label, capacity, replicas, persistent, created_at, deleted, delete_time";
const ACC_COLS: &str = "id, kind, resource_id, resource_label, subject, owner, access_level, new_access_level, limited, changed_at";
const DEP_COLS: &str = "id, namespace_id, name, owner, created_at, deleted, delete_time";
const VER_COLS: &str = "id, deployment_id, major, minor, patch, spec, active, created_at";
const ING_COLS: &str = "id, namespace_id, name, domain, path, service_name, service_port, tls, owner, created_at, deleted, delete_time";

/// Handle to an open transaction. Only [`crate::SqliteStore::transactional`] creates one.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn exec<P: Params>(&self, sql: &str, params: P) -> Result<usize, StoreError> {
        debug!(sql = %sql.split_whitespace().take(4).collect::<Vec<_>>().join(" "), "persist: exec");
        self.conn.prepare_cached(sql).map_err(sql_err)?.execute(params).map_err(sql_err)
    }

    fn query_all<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: fn(&Row<'_>) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(sql_err)?;
        let mut rows = stmt.query(params).map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            out.push(map(row)?);
        }
        Ok(out)
    }

    fn query_one<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: fn(&Row<'_>) -> Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        Ok(self.query_all(sql, params, map)?.into_iter().next())
    }

    fn count<P: Params>(&self, sql: &str, params: P) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(sql, params, |r| r.get(0)).map_err(sql_err)?;
        Ok(n.max(0) as u64)
    }

    /// Fails when an update or delete by key touched no row.
    fn expect_one(n: usize, what: &str, id: Uuid) -> Result<(), StoreError> {
        if n == 0 {
            return Err(StoreError::Query(format!("{} {} not found", what, id)));
        }
        Ok(())
    }

    // ---- namespaces ----

    pub fn insert_namespace(&self, ns: &Namespace) -> Result<(), StoreError> {
        self.exec(
            &format!("INSERT INTO namespaces ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)", NS_COLS),
            params![
                ns.id.to_string(),
                ns.owner.to_string(),
                ns.label,
                qty_param(ns.limits.cpu)?,
                qty_param(ns.limits.ram)?,
                qty_param(ns.limits.max_ext_services)?,
                qty_param(ns.limits.max_int_services)?,
                qty_param(ns.limits.max_traffic)?,
                ns.tariff_id,
                ns.created_at.timestamp_millis(),
                ns.deleted,
                ns.delete_time.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// Live namespace by id; soft-deleted rows are invisible.
    pub fn namespace(&self, id: ResourceId) -> Result<Option<Namespace>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM namespaces WHERE id = ?1 AND deleted = 0", NS_COLS),
            [id.to_string()],
            namespace_row,
        )
    }

    pub fn namespaces_owned_by(&self, owner: UserId) -> Result<Vec<Namespace>, StoreError> {
        self.query_all(
            &format!("SELECT {} FROM namespaces WHERE owner = ?1 AND deleted = 0 ORDER BY label", NS_COLS),
            [owner.to_string()],
            namespace_row,
        )
    }

    pub fn set_namespace_limits(&self, id: ResourceId, limits: &Limits, tariff_id: Option<&str>) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE namespaces SET cpu = ?2, ram = ?3, max_ext_services = ?4, max_int_services = ?5, max_traffic = ?6, tariff_id = ?7 WHERE id = ?1",
            params![
                id.to_string(),
                qty_param(limits.cpu)?,
                qty_param(limits.ram)?,
                qty_param(limits.max_ext_services)?,
                qty_param(limits.max_int_services)?,
                qty_param(limits.max_traffic)?,
                tariff_id,
            ],
        )?;
        Self::expect_one(n, "namespace", id)
    }

    pub fn rename_namespace(&self, id: ResourceId, label: &str) -> Result<(), StoreError> {
        let n = self.exec("UPDATE namespaces SET label = ?2 WHERE id = ?1", params![id.to_string(), label])?;
        Self::expect_one(n, "namespace", id)
    }

    pub fn soft_delete_namespace(&self, id: ResourceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE namespaces SET deleted = 1, delete_time = ?2 WHERE id = ?1 AND deleted = 0",
            params![id.to_string(), at.timestamp_millis()],
        )?;
        Self::expect_one(n, "namespace", id)
    }

    pub fn restore_namespace(&self, id: ResourceId) -> Result<(), StoreError> {
        let n = self.exec("UPDATE namespaces SET deleted = 0, delete_time = NULL WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "namespace", id)
    }

    /// Removes a namespace row outright. Used only to undo a creation.
    pub fn purge_namespace(&self, id: ResourceId) -> Result<(), StoreError> {
        let n = self.exec("DELETE FROM namespaces WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "namespace", id)
    }

    // ---- volumes ----

    pub fn insert_volume(&self, v: &Volume) -> Result<(), StoreError> {
        self.exec(
            &format!("INSERT INTO volumes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", VOL_COLS),
            params![
                v.id.to_string(),
                v.owner.to_string(),
                v.label,
                qty_param(v.capacity)?,
                i64::from(v.replicas),
                v.persistent,
                v.created_at.timestamp_millis(),
                v.deleted,
                v.delete_time.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn volume(&self, id: ResourceId) -> Result<Option<Volume>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM volumes WHERE id = ?1 AND deleted = 0", VOL_COLS),
            [id.to_string()],
            volume_row,
        )
    }

    pub fn rename_volume(&self, id: ResourceId, label: &str) -> Result<(), StoreError> {
        let n = self.exec("UPDATE volumes SET label = ?2 WHERE id = ?1 AND deleted = 0", params![id.to_string(), label])?;
        Self::expect_one(n, "volume", id)
    }

    pub fn resize_volume(&self, id: ResourceId, capacity: u64, replicas: u32) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE volumes SET capacity = ?2, replicas = ?3 WHERE id = ?1 AND deleted = 0",
            params![id.to_string(), qty_param(capacity)?, i64::from(replicas)],
        )?;
        Self::expect_one(n, "volume", id)
    }

    pub fn soft_delete_volume(&self, id: ResourceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE volumes SET deleted = 1, delete_time = ?2 WHERE id = ?1 AND deleted = 0",
            params![id.to_string(), at.timestamp_millis()],
        )?;
        Self::expect_one(n, "volume", id)
    }

    pub fn attach_volume(&self, namespace_id: ResourceId, volume_id: ResourceId) -> Result<(), StoreError> {
        self.exec(
            "INSERT INTO namespace_volumes (namespace_id, volume_id) VALUES (?1, ?2)",
            params![namespace_id.to_string(), volume_id.to_string()],
        )?;
        Ok(())
    }

    /// Returns whether an association existed.
    pub fn detach_volume(&self, namespace_id: ResourceId, volume_id: ResourceId) -> Result<bool, StoreError> {
        let n = self.exec(
            "DELETE FROM namespace_volumes WHERE namespace_id = ?1 AND volume_id = ?2",
            params![namespace_id.to_string(), volume_id.to_string()],
        )?;
        Ok(n > 0)
    }

    pub fn volumes_of_namespace(&self, namespace_id: ResourceId) -> Result<Vec<Volume>, StoreError> {
        self.query_all(
            "SELECT v.id, v.owner, v.label, v.capacity, v.replicas, v.persistent, v.created_at, v.deleted, v.delete_time
             FROM volumes v JOIN namespace_volumes nv ON nv.volume_id = v.id
             WHERE nv.namespace_id = ?1 AND v.deleted = 0 ORDER BY v.label",
            [namespace_id.to_string()],
            volume_row,
        )
    }

    pub fn namespaces_of_volume(&self, volume_id: ResourceId) -> Result<Vec<ResourceId>, StoreError> {
        self.query_all(
            "SELECT nv.namespace_id FROM namespace_volumes nv JOIN namespaces n ON n.id = nv.namespace_id
             WHERE nv.volume_id = ?1 AND n.deleted = 0 ORDER BY nv.namespace_id",
            [volume_id.to_string()],
            |r| uuid_col(r, 0),
        )
    }

    // ---- access records ----

    /// Inserts or replaces the record for (kind, resource, subject). The row
    /// id of an existing record is kept.
    pub fn upsert_access(&self, a: &AccessRecord) -> Result<(), StoreError> {
        self.exec(
            &format!(
                "INSERT INTO accesses ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (kind, resource_id, subject) DO UPDATE SET
                    resource_label = excluded.resource_label,
                    owner = excluded.owner,
                    access_level = excluded.access_level,
                    new_access_level = excluded.new_access_level,
                    limited = excluded.limited,
                    changed_at = excluded.changed_at",
                ACC_COLS
            ),
            params![
                a.id.to_string(),
                a.kind.as_str(),
                a.resource_id.to_string(),
                a.resource_label,
                a.subject.to_string(),
                a.owner.to_string(),
                a.access_level.rank(),
                a.new_access_level.rank(),
                a.limited,
                a.changed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn access(&self, kind: ResourceKind, resource_id: ResourceId, subject: UserId) -> Result<Option<AccessRecord>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM accesses WHERE kind = ?1 AND resource_id = ?2 AND subject = ?3", ACC_COLS),
            params![kind.as_str(), resource_id.to_string(), subject.to_string()],
            access_row,
        )
    }

    /// The subject's record addressed by the label they know the resource under.
    pub fn access_by_label(&self, subject: UserId, kind: ResourceKind, label: &str) -> Result<Option<AccessRecord>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM accesses WHERE subject = ?1 AND kind = ?2 AND resource_label = ?3", ACC_COLS),
            params![subject.to_string(), kind.as_str(), label],
            access_row,
        )
    }

    pub fn accesses_for_resource(&self, kind: ResourceKind, resource_id: ResourceId) -> Result<Vec<AccessRecord>, StoreError> {
        self.query_all(
            &format!("SELECT {} FROM accesses WHERE kind = ?1 AND resource_id = ?2 ORDER BY subject", ACC_COLS),
            params![kind.as_str(), resource_id.to_string()],
            access_row,
        )
    }

    pub fn accesses_of_subject(&self, subject: UserId) -> Result<Vec<AccessRecord>, StoreError> {
        self.query_all(
            &format!("SELECT {} FROM accesses WHERE subject = ?1 ORDER BY kind, resource_label", ACC_COLS),
            [subject.to_string()],
            access_row,
        )
    }

    /// Every record whose resource belongs to `owner`, optionally of one kind.
    pub fn accesses_owned_by(&self, owner: UserId, kind: Option<ResourceKind>) -> Result<Vec<AccessRecord>, StoreError> {
        match kind {
            Some(k) => self.query_all(
                &format!("SELECT {} FROM accesses WHERE owner = ?1 AND kind = ?2 ORDER BY id", ACC_COLS),
                params![owner.to_string(), k.as_str()],
                access_row,
            ),
            None => self.query_all(
                &format!("SELECT {} FROM accesses WHERE owner = ?1 ORDER BY id", ACC_COLS),
                [owner.to_string()],
                access_row,
            ),
        }
    }

    pub fn set_effective_access(
        &self,
        id: Uuid,
        new_level: AccessLevel,
        limited: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE accesses SET new_access_level = ?2, limited = ?3, changed_at = ?4 WHERE id = ?1",
            params![id.to_string(), new_level.rank(), limited, at.timestamp_millis()],
        )?;
        Self::expect_one(n, "access", id)
    }

    pub fn relabel_access(&self, id: Uuid, label: &str) -> Result<(), StoreError> {
        let n = self.exec("UPDATE accesses SET resource_label = ?2 WHERE id = ?1", params![id.to_string(), label])?;
        Self::expect_one(n, "access", id)
    }

    pub fn delete_access(&self, id: Uuid) -> Result<(), StoreError> {
        let n = self.exec("DELETE FROM accesses WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "access", id)
    }

    pub fn delete_resource_accesses(&self, kind: ResourceKind, resource_id: ResourceId) -> Result<usize, StoreError> {
        self.exec(
            "DELETE FROM accesses WHERE kind = ?1 AND resource_id = ?2",
            params![kind.as_str(), resource_id.to_string()],
        )
    }

    /// Standing ceiling for everything `owner` holds of `kind`, if restricted.
    pub fn owner_ceiling(&self, owner: UserId, kind: ResourceKind) -> Result<Option<AccessLevel>, StoreError> {
        self.query_one(
            "SELECT ceiling FROM owner_ceilings WHERE owner = ?1 AND kind = ?2",
            params![owner.to_string(), kind.as_str()],
            ceiling_row,
        )
    }

    /// Records the ceiling; `Owner` lifts it and removes the row.
    pub fn set_owner_ceiling(
        &self,
        owner: UserId,
        kind: ResourceKind,
        ceiling: AccessLevel,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if ceiling == AccessLevel::Owner {
            self.exec(
                "DELETE FROM owner_ceilings WHERE owner = ?1 AND kind = ?2",
                params![owner.to_string(), kind.as_str()],
            )?;
            return Ok(());
        }
        self.exec(
            "INSERT INTO owner_ceilings (owner, kind, ceiling, changed_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (owner, kind) DO UPDATE SET ceiling = excluded.ceiling, changed_at = excluded.changed_at",
            params![owner.to_string(), kind.as_str(), ceiling.rank(), at.timestamp_millis()],
        )?;
        Ok(())
    }

    // ---- deployments ----

    pub fn insert_deployment(&self, d: &Deployment) -> Result<(), StoreError> {
        self.exec(
            &format!("INSERT INTO deployments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", DEP_COLS),
            params![
                d.id.to_string(),
                d.namespace_id.to_string(),
                d.name,
                d.owner.to_string(),
                d.created_at.timestamp_millis(),
                d.deleted,
                d.delete_time.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn deployment_by_name(&self, namespace_id: ResourceId, name: &str) -> Result<Option<Deployment>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM deployments WHERE namespace_id = ?1 AND name = ?2 AND deleted = 0", DEP_COLS),
            params![namespace_id.to_string(), name],
            deployment_row,
        )
    }

    pub fn deployments_in(&self, namespace_id: ResourceId) -> Result<Vec<Deployment>, StoreError> {
        self.query_all(
            &format!("SELECT {} FROM deployments WHERE namespace_id = ?1 AND deleted = 0 ORDER BY name", DEP_COLS),
            [namespace_id.to_string()],
            deployment_row,
        )
    }

    pub fn soft_delete_deployment(&self, id: ResourceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE deployments SET deleted = 1, delete_time = ?2 WHERE id = ?1 AND deleted = 0",
            params![id.to_string(), at.timestamp_millis()],
        )?;
        Self::expect_one(n, "deployment", id)
    }

    pub fn restore_deployment(&self, id: ResourceId) -> Result<(), StoreError> {
        let n = self.exec("UPDATE deployments SET deleted = 0, delete_time = NULL WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "deployment", id)
    }

    /// Removes a deployment row and its versions. Used only to undo a creation.
    pub fn purge_deployment(&self, id: ResourceId) -> Result<(), StoreError> {
        self.exec("DELETE FROM versions WHERE deployment_id = ?1", [id.to_string()])?;
        let n = self.exec("DELETE FROM deployments WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "deployment", id)
    }

    // ---- versions ----

    pub fn insert_version(&self, v: &Version) -> Result<(), StoreError> {
        let spec = serde_json::to_string(&v.spec).map_err(|e| StoreError::Query(format!("encode spec: {}", e)))?;
        let (major, minor, patch) = semver_cols(v.version)?;
        self.exec(
            &format!("INSERT INTO versions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", VER_COLS),
            params![
                v.id.to_string(),
                v.deployment_id.to_string(),
                major,
                minor,
                patch,
                spec,
                v.active,
                v.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// All versions of a deployment in ascending version order.
    pub fn versions(&self, deployment_id: ResourceId) -> Result<Vec<Version>, StoreError> {
        self.query_all(
            &format!("SELECT {} FROM versions WHERE deployment_id = ?1 ORDER BY major, minor, patch", VER_COLS),
            [deployment_id.to_string()],
            version_row,
        )
    }

    pub fn active_version(&self, deployment_id: ResourceId) -> Result<Option<Version>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM versions WHERE deployment_id = ?1 AND active = 1", VER_COLS),
            [deployment_id.to_string()],
            version_row,
        )
    }

    /// Makes `target` the only active version, or leaves none active.
    /// Both statements run in the caller's transaction so only the final
    /// state is observable.
    pub fn set_active(&self, deployment_id: ResourceId, target: Option<Uuid>) -> Result<(), StoreError> {
        self.exec(
            "UPDATE versions SET active = 0 WHERE deployment_id = ?1 AND active = 1",
            [deployment_id.to_string()],
        )?;
        if let Some(id) = target {
            let n = self.exec(
                "UPDATE versions SET active = 1 WHERE id = ?1 AND deployment_id = ?2",
                params![id.to_string(), deployment_id.to_string()],
            )?;
            Self::expect_one(n, "version", id)?;
        }
        Ok(())
    }

    /// In-place rewrite of a version's spec (replica changes on the active version).
    pub fn update_version_spec(&self, id: Uuid, spec: &DeploymentSpec) -> Result<(), StoreError> {
        let spec = serde_json::to_string(spec).map_err(|e| StoreError::Query(format!("encode spec: {}", e)))?;
        let n = self.exec("UPDATE versions SET spec = ?2 WHERE id = ?1", params![id.to_string(), spec])?;
        Self::expect_one(n, "version", id)
    }

    pub fn rename_version(&self, id: Uuid, to: SemVer) -> Result<(), StoreError> {
        let (major, minor, patch) = semver_cols(to)?;
        let n = self.exec(
            "UPDATE versions SET major = ?2, minor = ?3, patch = ?4 WHERE id = ?1",
            params![id.to_string(), major, minor, patch],
        )?;
        Self::expect_one(n, "version", id)
    }

    pub fn delete_version(&self, id: Uuid) -> Result<(), StoreError> {
        let n = self.exec("DELETE FROM versions WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "version", id)
    }

    /// Specs of the active version of every live deployment in a namespace.
    pub fn active_specs_in(&self, namespace_id: ResourceId) -> Result<Vec<DeploymentSpec>, StoreError> {
        self.query_all(
            "SELECT v.spec FROM versions v JOIN deployments d ON d.id = v.deployment_id
             WHERE d.namespace_id = ?1 AND d.deleted = 0 AND v.active = 1 ORDER BY d.name",
            [namespace_id.to_string()],
            |r| spec_col(r, 0),
        )
    }

    // ---- domains ----

    pub fn insert_domain(&self, d: &Domain) -> Result<(), StoreError> {
        let ips = serde_json::to_string(&d.ips).map_err(|e| StoreError::Query(format!("encode ips: {}", e)))?;
        self.exec(
            "INSERT INTO domains (id, domain, grp, ips) VALUES (?1, ?2, ?3, ?4)",
            params![d.id.to_string(), d.domain, d.group, ips],
        )?;
        Ok(())
    }

    pub fn domain(&self, name: &str) -> Result<Option<Domain>, StoreError> {
        self.query_one("SELECT id, domain, grp, ips FROM domains WHERE domain = ?1", [name], domain_row)
    }

    pub fn domains(&self) -> Result<Vec<Domain>, StoreError> {
        self.query_all("SELECT id, domain, grp, ips FROM domains ORDER BY domain", [], domain_row)
    }

    pub fn delete_domain(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.exec("DELETE FROM domains WHERE domain = ?1", [name])? > 0)
    }

    // ---- ingresses ----

    pub fn insert_ingress(&self, i: &Ingress) -> Result<(), StoreError> {
        self.exec(
            &format!("INSERT INTO ingresses ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)", ING_COLS),
            params![
                i.id.to_string(),
                i.namespace_id.to_string(),
                i.name,
                i.domain,
                i.path,
                i.service_name,
                i.service_port as i64,
                i.tls,
                i.owner.to_string(),
                i.created_at.timestamp_millis(),
                i.deleted,
                i.delete_time.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn ingress(&self, namespace_id: ResourceId, name: &str) -> Result<Option<Ingress>, StoreError> {
        self.query_one(
            &format!("SELECT {} FROM ingresses WHERE namespace_id = ?1 AND name = ?2 AND deleted = 0", ING_COLS),
            params![namespace_id.to_string(), name],
            ingress_row,
        )
    }

    pub fn ingresses_in(&self, namespace_id: ResourceId) -> Result<Vec<Ingress>, StoreError> {
        self.query_all(
            &format!("SELECT {} FROM ingresses WHERE namespace_id = ?1 AND deleted = 0 ORDER BY name", ING_COLS),
            [namespace_id.to_string()],
            ingress_row,
        )
    }

    pub fn count_ingresses_on_domain(&self, domain: &str) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM ingresses WHERE domain = ?1 AND deleted = 0", [domain])
    }

    pub fn soft_delete_ingress(&self, id: ResourceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let n = self.exec(
            "UPDATE ingresses SET deleted = 1, delete_time = ?2 WHERE id = ?1 AND deleted = 0",
            params![id.to_string(), at.timestamp_millis()],
        )?;
        Self::expect_one(n, "ingress", id)
    }

    pub fn restore_ingress(&self, id: ResourceId) -> Result<(), StoreError> {
        let n = self.exec("UPDATE ingresses SET deleted = 0, delete_time = NULL WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "ingress", id)
    }

    /// Removes an ingress row outright. Used only to undo a creation.
    pub fn purge_ingress(&self, id: ResourceId) -> Result<(), StoreError> {
        let n = self.exec("DELETE FROM ingresses WHERE id = ?1", [id.to_string()])?;
        Self::expect_one(n, "ingress", id)
    }

    // ---- usage ----

    pub fn count_volumes_in(&self, namespace_id: ResourceId) -> Result<u64, StoreError> {
        self.count(
            "SELECT COUNT(*) FROM namespace_volumes nv JOIN volumes v ON v.id = nv.volume_id
             WHERE nv.namespace_id = ?1 AND v.deleted = 0",
            [namespace_id.to_string()],
        )
    }

    pub fn count_deployments_in(&self, namespace_id: ResourceId) -> Result<u64, StoreError> {
        self.count(
            "SELECT COUNT(*) FROM deployments WHERE namespace_id = ?1 AND deleted = 0",
            [namespace_id.to_string()],
        )
    }

    pub fn count_ingresses_in(&self, namespace_id: ResourceId) -> Result<u64, StoreError> {
        self.count(
            "SELECT COUNT(*) FROM ingresses WHERE namespace_id = ?1 AND deleted = 0",
            [namespace_id.to_string()],
        )
    }

    pub fn resource_counts(&self, owner: UserId) -> Result<ResourceCounts, StoreError> {
        let o = owner.to_string();
        Ok(ResourceCounts {
            namespaces: self.count("SELECT COUNT(*) FROM namespaces WHERE owner = ?1 AND deleted = 0", [&o])?,
            volumes: self.count("SELECT COUNT(*) FROM volumes WHERE owner = ?1 AND deleted = 0", [&o])?,
            deployments: self.count("SELECT COUNT(*) FROM deployments WHERE owner = ?1 AND deleted = 0", [&o])?,
            ingresses: self.count("SELECT COUNT(*) FROM ingresses WHERE owner = ?1 AND deleted = 0", [&o])?,
        })
    }
}

// ---- row mapping ----

fn col<T: FromSql>(row: &Row<'_>, idx: usize) -> Result<T, StoreError> {
    row.get(idx).map_err(sql_err)
}

fn uuid_col(row: &Row<'_>, idx: usize) -> Result<Uuid, StoreError> {
    let s: String = col(row, idx)?;
    Uuid::parse_str(&s).map_err(|e| StoreError::Corrupt(format!("uuid {:?}: {}", s, e)))
}

fn u64_col(row: &Row<'_>, idx: usize) -> Result<u64, StoreError> {
    let n: i64 = col(row, idx)?;
    u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative quantity {}", n)))
}

/// SQLite integers are signed; quantities above `i64::MAX` are refused
/// before they can be read back as negative.
fn qty_param(n: u64) -> Result<i64, StoreError> {
    i64::try_from(n).map_err(|_| StoreError::Query(format!("quantity {} is out of storable range", n)))
}

fn semver_cols(v: SemVer) -> Result<(i64, i64, i64), StoreError> {
    Ok((qty_param(v.major)?, qty_param(v.minor)?, qty_param(v.patch)?))
}

fn time_col(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, StoreError> {
    let ms: i64 = col(row, idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {}", ms)))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> Result<Option<DateTime<Utc>>, StoreError> {
    let ms: Option<i64> = col(row, idx)?;
    ms.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {}", ms)))
    })
    .transpose()
}

fn level_col(row: &Row<'_>, idx: usize) -> Result<AccessLevel, StoreError> {
    let n: i64 = col(row, idx)?;
    AccessLevel::from_rank(n).ok_or_else(|| StoreError::Corrupt(format!("access level {}", n)))
}

fn ceiling_row(r: &Row<'_>) -> Result<AccessLevel, StoreError> {
    level_col(r, 0)
}

fn spec_col(row: &Row<'_>, idx: usize) -> Result<DeploymentSpec, StoreError> {
    let s: String = col(row, idx)?;
    serde_json::from_str(&s).map_err(|e| StoreError::Corrupt(format!("deployment spec: {}", e)))
}

fn namespace_row(r: &Row<'_>) -> Result<Namespace, StoreError> {
    Ok(Namespace {
        id: uuid_col(r, 0)?,
        owner: uuid_col(r, 1)?,
        label: col(r, 2)?,
        limits: Limits {
            cpu: u64_col(r, 3)?,
            ram: u64_col(r, 4)?,
            max_ext_services: u64_col(r, 5)?,
            max_int_services: u64_col(r, 6)?,
            max_traffic: u64_col(r, 7)?,
        },
        tariff_id: col(r, 8)?,
        created_at: time_col(r, 9)?,
        deleted: col(r, 10)?,
        delete_time: opt_time_col(r, 11)?,
    })
}

fn volume_row(r: &Row<'_>) -> Result<Volume, StoreError> {
    Ok(Volume {
        id: uuid_col(r, 0)?,
        owner: uuid_col(r, 1)?,
        label: col(r, 2)?,
        capacity: u64_col(r, 3)?,
        replicas: u64_col(r, 4)? as u32,
        persistent: col(r, 5)?,
        created_at: time_col(r, 6)?,
        deleted: col(r, 7)?,
        delete_time: opt_time_col(r, 8)?,
    })
}

fn access_row(r: &Row<'_>) -> Result<AccessRecord, StoreError> {
    let kind: String = col(r, 1)?;
    Ok(AccessRecord {
        id: uuid_col(r, 0)?,
        kind: kind.parse().map_err(|_| StoreError::Corrupt(format!("resource kind {:?}", kind)))?,
        resource_id: uuid_col(r, 2)?,
        resource_label: col(r, 3)?,
        subject: uuid_col(r, 4)?,
        owner: uuid_col(r, 5)?,
        access_level: level_col(r, 6)?,
        new_access_level: level_col(r, 7)?,
        limited: col(r, 8)?,
        changed_at: time_col(r, 9)?,
    })
}

fn deployment_row(r: &Row<'_>) -> Result<Deployment, StoreError> {
    Ok(Deployment {
        id: uuid_col(r, 0)?,
        namespace_id: uuid_col(r, 1)?,
        name: col(r, 2)?,
        owner: uuid_col(r, 3)?,
        created_at: time_col(r, 4)?,
        deleted: col(r, 5)?,
        delete_time: opt_time_col(r, 6)?,
    })
}

fn version_row(r: &Row<'_>) -> Result<Version, StoreError> {
    Ok(Version {
        id: uuid_col(r, 0)?,
        deployment_id: uuid_col(r, 1)?,
        version: SemVer::new(u64_col(r, 2)?, u64_col(r, 3)?, u64_col(r, 4)?),
        spec: spec_col(r, 5)?,
        active: col(r, 6)?,
        created_at: time_col(r, 7)?,
    })
}

fn domain_row(r: &Row<'_>) -> Result<Domain, StoreError> {
    let ips: String = col(r, 3)?;
    Ok(Domain {
        id: uuid_col(r, 0)?,
        domain: col(r, 1)?,
        group: col(r, 2)?,
        ips: serde_json::from_str(&ips).map_err(|e| StoreError::Corrupt(format!("domain ips: {}", e)))?,
    })
}

fn ingress_row(r: &Row<'_>) -> Result<Ingress, StoreError> {
    Ok(Ingress {
        id: uuid_col(r, 0)?,
        namespace_id: uuid_col(r, 1)?,
        name: col(r, 2)?,
        domain: col(r, 3)?,
        path: col(r, 4)?,
        service_name: col(r, 5)?,
        service_port: u64_col(r, 6)? as u16,
        tls: col(r, 7)?,
        owner: uuid_col(r, 8)?,
        created_at: time_col(r, 9)?,
        deleted: col(r, 10)?,
        delete_time: opt_time_col(r, 11)?,
    })
}
