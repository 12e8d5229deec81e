//! Tenant and project directory.
//!
//! Tenants are the root isolation boundary. A tenant is immutable once
//! created except for its status; suspending a tenant refuses new
//! configuration changes and workflow runs without touching stored data.
//! Projects are unique by name within their tenant and own every model,
//! relationship, policy set, and workflow the rest of the engine manages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::info;

use crate::context::RequestContext;
use crate::error::TenancyError;

/// Tree name for tenant records.
const TENANT_TREE: &str = "tenancy:tenants";

/// Tree name for project records.
const PROJECT_TREE: &str = "tenancy:projects";

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    /// Accepting configuration changes and workflow runs.
    Active,
    /// Refusing new work; existing data untouched.
    Suspended,
}

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
    /// Under construction.
    Draft,
    /// Serving workflow runs.
    Active,
    /// Retained for audit, refusing new workflows.
    Deprecated,
}

/// A tenant record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Stable tenant id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: TenantStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// A project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Stable project id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Name, unique within the tenant.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Lifecycle status.
    pub status: ProjectStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Directory of tenants and their projects.
pub struct TenantDirectory {
    tenants: Tree,
    projects: Tree,
}

impl TenantDirectory {
    /// Open the directory trees on the given database.
    pub fn open(db: &Db) -> Result<Self, TenancyError> {
        let tenants = db.open_tree(TENANT_TREE).map_err(Self::backend)?;
        let projects = db.open_tree(PROJECT_TREE).map_err(Self::backend)?;
        Ok(Self { tenants, projects })
    }

    /// Create a tenant. Fails if the id is already taken.
    pub fn create_tenant(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Tenant, TenancyError> {
        let id = id.into();
        let now = Utc::now();
        let tenant = Tenant {
            id: id.clone(),
            name: name.into(),
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let bytes = Self::encode(&tenant)?;
        let swapped = self
            .tenants
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(Self::backend)?;
        if swapped.is_err() {
            return Err(TenancyError::DuplicateTenant(id));
        }

        info!(tenant = %tenant.id, "tenant created");
        Ok(tenant)
    }

    /// Get a tenant by id.
    pub fn get_tenant(&self, id: &str) -> Result<Tenant, TenancyError> {
        match self.tenants.get(id.as_bytes()).map_err(Self::backend)? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(TenancyError::UnknownTenant(id.to_string())),
        }
    }

    /// Change a tenant's status. The only mutable tenant attribute.
    pub fn set_tenant_status(
        &self,
        id: &str,
        status: TenantStatus,
    ) -> Result<Tenant, TenancyError> {
        let mut tenant = self.get_tenant(id)?;
        tenant.status = status;
        tenant.updated_at = Utc::now();

        let bytes = Self::encode(&tenant)?;
        self.tenants
            .insert(id.as_bytes(), bytes)
            .map_err(Self::backend)?;

        info!(tenant = %id, ?status, "tenant status changed");
        Ok(tenant)
    }

    /// Error unless the context's tenant exists and is active.
    pub fn ensure_active(&self, ctx: &RequestContext) -> Result<Tenant, TenancyError> {
        let tenant = self.get_tenant(&ctx.tenant_id)?;
        if tenant.status == TenantStatus::Suspended {
            return Err(TenancyError::TenantSuspended(tenant.id));
        }
        Ok(tenant)
    }

    /// Create a project under the context's tenant. Project names are unique
    /// within a tenant.
    pub fn create_project(
        &self,
        ctx: &RequestContext,
        id: impl Into<String>,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<Project, TenancyError> {
        let tenant = self.ensure_active(ctx)?;
        let id = id.into();
        let name = name.into();

        for existing in self.list_projects(&tenant.id)? {
            if existing.name == name {
                return Err(TenancyError::DuplicateProjectName {
                    tenant: tenant.id,
                    name,
                });
            }
        }

        let now = Utc::now();
        let project = Project {
            id: id.clone(),
            tenant_id: tenant.id.clone(),
            name,
            description,
            status: ProjectStatus::Draft,
            created_at: now,
            updated_at: now,
        };

        let key = Self::project_key(&tenant.id, &id);
        let bytes = Self::encode(&project)?;
        let swapped = self
            .projects
            .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))
            .map_err(Self::backend)?;
        if swapped.is_err() {
            return Err(TenancyError::DuplicateProjectName {
                tenant: tenant.id,
                name: project.name,
            });
        }

        info!(tenant = %project.tenant_id, project = %project.id, "project created");
        Ok(project)
    }

    /// Get a project, scoped to the context's tenant.
    pub fn get_project(&self, ctx: &RequestContext, id: &str) -> Result<Project, TenancyError> {
        let key = Self::project_key(&ctx.tenant_id, id);
        match self.projects.get(key).map_err(Self::backend)? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(TenancyError::UnknownProject(id.to_string())),
        }
    }

    /// Change a project's status.
    pub fn set_project_status(
        &self,
        ctx: &RequestContext,
        id: &str,
        status: ProjectStatus,
    ) -> Result<Project, TenancyError> {
        self.ensure_active(ctx)?;
        let mut project = self.get_project(ctx, id)?;
        project.status = status;
        project.updated_at = Utc::now();

        let key = Self::project_key(&ctx.tenant_id, id);
        let bytes = Self::encode(&project)?;
        self.projects.insert(key, bytes).map_err(Self::backend)?;
        Ok(project)
    }

    /// List every project a tenant owns.
    pub fn list_projects(&self, tenant_id: &str) -> Result<Vec<Project>, TenancyError> {
        let mut prefix = tenant_id.as_bytes().to_vec();
        prefix.push(0);

        let mut projects = Vec::new();
        for result in self.projects.scan_prefix(prefix) {
            let (_, bytes) = result.map_err(Self::backend)?;
            projects.push(Self::decode(&bytes)?);
        }
        Ok(projects)
    }

    fn project_key(tenant: &str, project: &str) -> Vec<u8> {
        let mut key = tenant.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(project.as_bytes());
        key
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TenancyError> {
        serde_json::to_vec(value).map_err(|e| TenancyError::Storage(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, TenancyError> {
        serde_json::from_slice(bytes).map_err(|e| TenancyError::Storage(e.to_string()))
    }

    fn backend(e: sled::Error) -> TenancyError {
        TenancyError::Storage(e.to_string())
    }
}
