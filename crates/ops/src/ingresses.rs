//! Ingresses and the domain pool they draw from.

use tracing::{info, warn};
use uuid::Uuid;

use keel_core::{now, validate_name, AccessLevel, Domain, Ingress, KeelError, KeelResult};
use keel_kubehub::{OrchestratorOp, TlsMaterial};

use crate::{Coordinator, RequestCtx};

#[derive(Debug, Clone)]
pub struct IngressRequest {
    pub name: String,
    pub domain: String,
    pub path: String,
    pub service_name: String,
    pub service_port: u16,
    /// When set, a TLS secret is created before the ingress.
    pub tls: Option<TlsMaterial>,
}

fn validate_domain(domain: &str) -> KeelResult<()> {
    if domain.len() > 253 || domain.split('.').count() < 2 {
        return Err(KeelError::Validation(format!("invalid domain: {:?}", domain)));
    }
    domain.split('.').try_for_each(|part| validate_name("domain label", part))
}

impl Coordinator {
    /// Creates the ingress row, then the TLS secret if requested, then the
    /// remote ingress. A failed ingress removes the secret it created.
    pub async fn create_ingress(&self, ctx: &RequestCtx, ns_label: &str, req: IngressRequest) -> KeelResult<Ingress> {
        validate_name("ingress name", &req.name)?;
        validate_name("service name", &req.service_name)?;
        if !req.path.starts_with('/') {
            return Err(KeelError::Validation(format!("ingress path must start with '/': {:?}", req.path)));
        }
        let actor = ctx.actor;
        let (ns, ingress) = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            if tx.domain(&req.domain)?.is_none() {
                return Err(KeelError::not_found(format!("domain {}", req.domain)));
            }
            if tx.ingress(ns.id, &req.name)?.is_some() {
                return Err(KeelError::AlreadyExists(format!("ingress {}", req.name)));
            }
            let ingress = Ingress {
                id: Uuid::new_v4(),
                namespace_id: ns.id,
                name: req.name.clone(),
                domain: req.domain.clone(),
                path: req.path.clone(),
                service_name: req.service_name.clone(),
                service_port: req.service_port,
                tls: req.tls.is_some(),
                owner: ns.owner,
                created_at: now(),
                deleted: false,
                delete_time: None,
            };
            tx.insert_ingress(&ingress)?;
            Ok((ns, ingress))
        })?;

        let secret = ingress.tls_secret_name();
        if let Some(tls) = &req.tls {
            let op = OrchestratorOp::CreateSecret;
            if let Err(e) = self.remote(ctx, op, self.orchestrator.create_secret(&actor, &ns, &secret, tls)).await {
                return Err(self.compensate(op, e, |tx| Ok(tx.purge_ingress(ingress.id)?)));
            }
        }

        let op = OrchestratorOp::CreateIngress;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.create_ingress(&actor, &ns, &ingress)).await {
            // Cleanup runs even when the request itself was cancelled.
            let cleanup_ctx = RequestCtx::new(actor);
            let secret_err = match &req.tls {
                Some(_) => self
                    .remote(&cleanup_ctx, OrchestratorOp::DeleteSecret, self.orchestrator.delete_secret(&actor, &ns, &secret))
                    .await
                    .err(),
                None => None,
            };
            return Err(match (self.compensate(op, e, |tx| Ok(tx.purge_ingress(ingress.id)?)), secret_err) {
                (KeelError::Orchestrator(remote), Some(se)) => {
                    self.inconsistent(op, remote.to_string(), format!("delete secret {}: {}", secret, se))
                }
                (err, _) => err,
            });
        }
        info!(parent: &self.span, ns = %ns.id, ingress = %ingress.name, domain = %ingress.domain, tls = ingress.tls, "ingresses: created");
        Ok(ingress)
    }

    /// Deletes the ingress and then its TLS secret. The ingress delete is
    /// compensated; a secret left behind after the ingress is gone is reported
    /// as inconsistent state.
    pub async fn delete_ingress(&self, ctx: &RequestCtx, ns_label: &str, name: &str) -> KeelResult<()> {
        let actor = ctx.actor;
        let (ns, ingress) = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            let ingress = tx
                .ingress(ns.id, name)?
                .ok_or_else(|| KeelError::not_found(format!("ingress {}", name)))?;
            tx.soft_delete_ingress(ingress.id, now())?;
            Ok((ns, ingress))
        })?;

        let op = OrchestratorOp::DeleteIngress;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.delete_ingress(&actor, &ns, name)).await {
            return Err(self.compensate(op, e, |tx| Ok(tx.restore_ingress(ingress.id)?)));
        }
        if ingress.tls {
            let secret = ingress.tls_secret_name();
            let op = OrchestratorOp::DeleteSecret;
            let cleanup_ctx = RequestCtx::new(actor);
            if let Err(e) = self.remote(&cleanup_ctx, op, self.orchestrator.delete_secret(&actor, &ns, &secret)).await {
                warn!(parent: &self.span, ns = %ns.id, %secret, error = %e, "ingresses: secret left behind");
                return Err(self.inconsistent(op, e.to_string(), format!("ingress {} deleted, secret {} remains", name, secret)));
            }
        }
        info!(parent: &self.span, ns = %ns.id, ingress = name, "ingresses: deleted");
        Ok(())
    }

    pub fn get_ingress(&self, ctx: &RequestCtx, ns_label: &str, name: &str) -> KeelResult<Ingress> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            tx.ingress(ns.id, name)?.ok_or_else(|| KeelError::not_found(format!("ingress {}", name)))
        })
    }

    pub fn list_ingresses(&self, ctx: &RequestCtx, ns_label: &str) -> KeelResult<Vec<Ingress>> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            Ok(tx.ingresses_in(ns.id)?)
        })
    }

    // ---- domain pool (administrators) ----

    pub fn add_domain(&self, ctx: &RequestCtx, domain: &str, group: &str, ips: Vec<String>) -> KeelResult<Domain> {
        self.require_admin(ctx, "adding a domain")?;
        validate_domain(domain)?;
        let d = Domain { id: Uuid::new_v4(), domain: domain.to_string(), group: group.to_string(), ips };
        self.tx(|tx| {
            tx.insert_domain(&d)?;
            Ok(())
        })?;
        info!(parent: &self.span, domain, group, "domains: added");
        Ok(d)
    }

    pub fn list_domains(&self) -> KeelResult<Vec<Domain>> {
        self.tx(|tx| Ok(tx.domains()?))
    }

    pub fn get_domain(&self, domain: &str) -> KeelResult<Domain> {
        self.tx(|tx| tx.domain(domain)?.ok_or_else(|| KeelError::not_found(format!("domain {}", domain))))
    }

    /// Rejected while any live ingress uses the domain.
    pub fn delete_domain(&self, ctx: &RequestCtx, domain: &str) -> KeelResult<()> {
        self.require_admin(ctx, "deleting a domain")?;
        self.tx(|tx| {
            let bound = tx.count_ingresses_on_domain(domain)?;
            if bound > 0 {
                return Err(KeelError::Validation(format!("domain {} is used by {} ingress(es)", domain, bound)));
            }
            if !tx.delete_domain(domain)? {
                return Err(KeelError::not_found(format!("domain {}", domain)));
            }
            info!(parent: &self.span, domain, "domains: deleted");
            Ok(())
        })
    }
}
