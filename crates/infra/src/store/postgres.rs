//! Postgres-backed Authorization Store.
//!
//! ## Atomicity
//!
//! Every trait operation is either a single statement or one explicit
//! transaction. Upserts are `INSERT … ON CONFLICT … DO UPDATE` on the unique
//! keys listed in [`SCHEMA`], so two concurrent creates for the same pair end
//! up as one row (the loser becomes an update). `(xmax = 0)` in `RETURNING`
//! tells a fresh insert apart from an update.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Backend` with operation name and message |
//! | No row from a project upsert (parent gone or NOT_SET) | `MissingParent` |
//! | PoolClosed | `Backend` |
//! | Row decoding (unknown role code, bad column) | `Backend` |
//!
//! ## Runtime
//!
//! The trait is synchronous. Each call is driven to completion on the tokio
//! runtime handle given at construction, so callers must run on a thread that
//! is not itself inside that runtime (the consumer workers are plain threads).

use std::future::Future;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};
use uuid::Uuid;

use orgauth_auth::{
    OrganizationAuthorization, OrganizationRole, Project, ProjectAuthorization, ProjectRole,
    RequestPermissionOrganization, RequestPermissionProject, Upserted, User,
};
use orgauth_core::{
    OrganizationAuthorizationId, OrganizationId, ProjectAuthorizationId, ProjectId,
    RequestPermissionId, UserId,
};

use super::{
    AuthorizationStore, Ensured, ProjectMaterialization, ProjectRemoval, StoreError, StoreResult,
};

/// Tables backing the store. Applied by [`PostgresAuthorizationStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organization_authorizations (
    id              UUID PRIMARY KEY,
    organization_id UUID NOT NULL,
    user_id         UUID NOT NULL,
    user_email      TEXT NOT NULL,
    role            BIGINT NOT NULL,
    has_2fa         BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (organization_id, user_email)
);

CREATE TABLE IF NOT EXISTS project_authorizations (
    id                            UUID PRIMARY KEY,
    project_id                    UUID NOT NULL,
    organization_id               UUID NOT NULL,
    user_id                       UUID NOT NULL,
    user_email                    TEXT NOT NULL,
    role                          BIGINT NOT NULL,
    organization_authorization_id UUID NOT NULL
        REFERENCES organization_authorizations (id) ON DELETE CASCADE,
    created_at                    TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at                    TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (project_id, user_email)
);

CREATE INDEX IF NOT EXISTS project_authorizations_parent_idx
    ON project_authorizations (organization_authorization_id);

CREATE TABLE IF NOT EXISTS request_permission_organizations (
    id              UUID PRIMARY KEY,
    organization_id UUID NOT NULL,
    email           TEXT NOT NULL,
    role            BIGINT NOT NULL,
    created_by      UUID NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (organization_id, email)
);

CREATE TABLE IF NOT EXISTS request_permission_projects (
    id              UUID PRIMARY KEY,
    project_id      UUID NOT NULL,
    organization_id UUID NOT NULL,
    email           TEXT NOT NULL,
    role            BIGINT NOT NULL,
    created_by      UUID NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (project_id, email)
);
"#;

const ORG_AUTH_COLUMNS: &str =
    "id, organization_id, user_id, user_email, role, has_2fa, created_at, updated_at";

const PROJECT_AUTH_COLUMNS: &str = "id, project_id, organization_id, user_id, user_email, role, \
     organization_authorization_id, created_at, updated_at";

const ORG_INVITE_COLUMNS: &str = "id, organization_id, email, role, created_by, created_at";

const PROJECT_INVITE_COLUMNS: &str =
    "id, project_id, organization_id, email, role, created_by, created_at";

#[derive(Debug, Clone)]
pub struct PostgresAuthorizationStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresAuthorizationStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Open a pool on `database_url`.
    pub fn connect(database_url: &str, runtime: Handle) -> StoreResult<Self> {
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, runtime))
    }

    /// Create the tables if they do not exist yet.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// `SELECT columns FROM table WHERE filter`, binding `ids` first and then `texts`.
    #[allow(clippy::too_many_arguments)]
    async fn select<T>(
        &self,
        operation: &str,
        table: &str,
        columns: &str,
        filter: &str,
        ids: &[Uuid],
        texts: &[&str],
        decode: fn(&PgRow) -> StoreResult<T>,
    ) -> StoreResult<Vec<T>> {
        let sql = format!("SELECT {columns} FROM {table} WHERE {filter} ORDER BY id");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        for text in texts {
            query = query.bind(*text);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode).collect()
    }

    async fn fetch_org_auths(
        &self,
        operation: &str,
        filter: &str,
        ids: &[Uuid],
        texts: &[&str],
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        self.select(
            operation,
            "organization_authorizations",
            ORG_AUTH_COLUMNS,
            filter,
            ids,
            texts,
            org_auth_from_row,
        )
        .await
    }

    async fn fetch_project_auths(
        &self,
        operation: &str,
        filter: &str,
        ids: &[Uuid],
        texts: &[&str],
    ) -> StoreResult<Vec<ProjectAuthorization>> {
        self.select(
            operation,
            "project_authorizations",
            PROJECT_AUTH_COLUMNS,
            filter,
            ids,
            texts,
            project_auth_from_row,
        )
        .await
    }

    async fn fetch_org_invites(
        &self,
        operation: &str,
        filter: &str,
        ids: &[Uuid],
        texts: &[&str],
    ) -> StoreResult<Vec<RequestPermissionOrganization>> {
        self.select(
            operation,
            "request_permission_organizations",
            ORG_INVITE_COLUMNS,
            filter,
            ids,
            texts,
            org_invite_from_row,
        )
        .await
    }

    async fn fetch_project_invites(
        &self,
        operation: &str,
        filter: &str,
        ids: &[Uuid],
        texts: &[&str],
    ) -> StoreResult<Vec<RequestPermissionProject>> {
        self.select(
            operation,
            "request_permission_projects",
            PROJECT_INVITE_COLUMNS,
            filter,
            ids,
            texts,
            project_invite_from_row,
        )
        .await
    }
}

// -- statements shared by single operations and transactions ---------------

async fn upsert_org_auth(
    conn: &mut PgConnection,
    user: &User,
    organization_id: OrganizationId,
    role: OrganizationRole,
    has_2fa: bool,
) -> StoreResult<Upserted<OrganizationAuthorization>> {
    let sql = format!(
        r#"
        INSERT INTO organization_authorizations (id, organization_id, user_id, user_email, role, has_2fa)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (organization_id, user_email) DO UPDATE
        SET user_id = EXCLUDED.user_id,
            role = EXCLUDED.role,
            has_2fa = EXCLUDED.has_2fa,
            updated_at = now()
        RETURNING {ORG_AUTH_COLUMNS}, (xmax = 0) AS inserted
        "#
    );
    let row = sqlx::query(&sql)
        .bind(*OrganizationAuthorizationId::new().as_uuid())
        .bind(*organization_id.as_uuid())
        .bind(*user.id.as_uuid())
        .bind(&user.email)
        .bind(role.code())
        .bind(has_2fa)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("upsert_organization_authorization", e))?;

    upserted(&row, org_auth_from_row)
}

async fn ensure_org_auth(
    conn: &mut PgConnection,
    user: &User,
    organization_id: OrganizationId,
) -> StoreResult<Ensured<OrganizationAuthorization>> {
    // Only a missing row or a NOT_SET role is written; anything else is left alone.
    let sql = format!(
        r#"
        INSERT INTO organization_authorizations (id, organization_id, user_id, user_email, role, has_2fa)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (organization_id, user_email) DO UPDATE
        SET role = EXCLUDED.role,
            updated_at = now()
        WHERE organization_authorizations.role = $7
        RETURNING {ORG_AUTH_COLUMNS}, (xmax = 0) AS inserted
        "#
    );
    let row = sqlx::query(&sql)
        .bind(*OrganizationAuthorizationId::new().as_uuid())
        .bind(*organization_id.as_uuid())
        .bind(*user.id.as_uuid())
        .bind(&user.email)
        .bind(OrganizationRole::Viewer.code())
        .bind(user.has_2fa)
        .bind(OrganizationRole::NotSet.code())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_organization_authorization", e))?;

    if let Some(row) = row {
        return Ok(Ensured::Changed(upserted(&row, org_auth_from_row)?));
    }

    let sql = format!(
        "SELECT {ORG_AUTH_COLUMNS} FROM organization_authorizations \
         WHERE organization_id = $1 AND user_email = $2"
    );
    let row = sqlx::query(&sql)
        .bind(*organization_id.as_uuid())
        .bind(&user.email)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_organization_authorization", e))?;

    Ok(Ensured::Existing(org_auth_from_row(&row)?))
}

async fn upsert_project_auth(
    conn: &mut PgConnection,
    project: &Project,
    user: &User,
    role: ProjectRole,
    organization_authorization: &OrganizationAuthorization,
) -> StoreResult<Upserted<ProjectAuthorization>> {
    let sql = format!(
        r#"
        INSERT INTO project_authorizations
            (id, project_id, organization_id, user_id, user_email, role, organization_authorization_id)
        SELECT $1, $2, $3, $4, $5, $6, parent.id
        FROM organization_authorizations parent
        WHERE parent.id = $7 AND parent.role <> $8
        ON CONFLICT (project_id, user_email) DO UPDATE
        SET user_id = EXCLUDED.user_id,
            role = EXCLUDED.role,
            organization_authorization_id = EXCLUDED.organization_authorization_id,
            updated_at = now()
        RETURNING {PROJECT_AUTH_COLUMNS}, (xmax = 0) AS inserted
        "#
    );
    let row = sqlx::query(&sql)
        .bind(*ProjectAuthorizationId::new().as_uuid())
        .bind(*project.id.as_uuid())
        .bind(*project.organization_id.as_uuid())
        .bind(*user.id.as_uuid())
        .bind(&user.email)
        .bind(role.code())
        .bind(*organization_authorization.id.as_uuid())
        .bind(OrganizationRole::NotSet.code())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("upsert_project_authorization", e))?
        .ok_or(StoreError::MissingParent(organization_authorization.id))?;

    upserted(&row, project_auth_from_row)
}

// -- row decoding ----------------------------------------------------------

fn upserted<T>(
    row: &PgRow,
    decode: fn(&PgRow) -> StoreResult<T>,
) -> StoreResult<Upserted<T>> {
    let inserted: bool = column(row, "inserted")?;
    let record = decode(row)?;
    Ok(Upserted {
        created: inserted,
        record,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Backend(format!("failed to decode column {name}: {e}")))
}

fn organization_role(code: i64) -> StoreResult<OrganizationRole> {
    OrganizationRole::try_from(code).map_err(|e| StoreError::Backend(e.to_string()))
}

fn project_role(code: i64) -> StoreResult<ProjectRole> {
    ProjectRole::try_from(code).map_err(|e| StoreError::Backend(e.to_string()))
}

fn org_auth_from_row(row: &PgRow) -> StoreResult<OrganizationAuthorization> {
    Ok(OrganizationAuthorization {
        id: OrganizationAuthorizationId::from_uuid(column(row, "id")?),
        organization_id: OrganizationId::from_uuid(column(row, "organization_id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        user_email: column(row, "user_email")?,
        role: organization_role(column(row, "role")?)?,
        has_2fa: column(row, "has_2fa")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn project_auth_from_row(row: &PgRow) -> StoreResult<ProjectAuthorization> {
    Ok(ProjectAuthorization {
        id: ProjectAuthorizationId::from_uuid(column(row, "id")?),
        project_id: ProjectId::from_uuid(column(row, "project_id")?),
        organization_id: OrganizationId::from_uuid(column(row, "organization_id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        user_email: column(row, "user_email")?,
        role: project_role(column(row, "role")?)?,
        organization_authorization_id: OrganizationAuthorizationId::from_uuid(column(
            row,
            "organization_authorization_id",
        )?),
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn org_invite_from_row(row: &PgRow) -> StoreResult<RequestPermissionOrganization> {
    Ok(RequestPermissionOrganization {
        id: RequestPermissionId::from_uuid(column(row, "id")?),
        organization_id: OrganizationId::from_uuid(column(row, "organization_id")?),
        email: column(row, "email")?,
        role: organization_role(column(row, "role")?)?,
        created_by: UserId::from_uuid(column(row, "created_by")?),
        created_at: column(row, "created_at")?,
    })
}

fn project_invite_from_row(row: &PgRow) -> StoreResult<RequestPermissionProject> {
    Ok(RequestPermissionProject {
        id: RequestPermissionId::from_uuid(column(row, "id")?),
        project_id: ProjectId::from_uuid(column(row, "project_id")?),
        organization_id: OrganizationId::from_uuid(column(row, "organization_id")?),
        email: column(row, "email")?,
        role: project_role(column(row, "role")?)?,
        created_by: UserId::from_uuid(column(row, "created_by")?),
        created_at: column(row, "created_at")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Backend(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

impl AuthorizationStore for PostgresAuthorizationStore {
    #[instrument(
        skip(self, user),
        fields(organization_id = %organization_id, user_email = %user.email, created = tracing::field::Empty),
        err
    )]
    fn upsert_organization_authorization(
        &self,
        user: &User,
        organization_id: OrganizationId,
        role: OrganizationRole,
        has_2fa: bool,
    ) -> StoreResult<Upserted<OrganizationAuthorization>> {
        self.block_on(async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sqlx_error("acquire", e))?;
            let result = upsert_org_auth(&mut conn, user, organization_id, role, has_2fa).await?;
            Span::current().record("created", result.created);
            Ok(result)
        })
    }

    #[instrument(skip(self, user), fields(organization_id = %organization_id, user_email = %user.email), err)]
    fn ensure_organization_authorization(
        &self,
        user: &User,
        organization_id: OrganizationId,
    ) -> StoreResult<Ensured<OrganizationAuthorization>> {
        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let ensured = ensure_org_auth(&mut tx, user, organization_id).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(ensured)
        })
    }

    fn get_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<OrganizationAuthorization>> {
        let found = self.block_on(self.fetch_org_auths(
            "get_organization_authorization",
            "organization_id = $1 AND user_email = $2",
            &[*organization_id.as_uuid()],
            &[email],
        ))?;
        Ok(found.into_iter().next())
    }

    fn get_organization_authorization_by_id(
        &self,
        id: OrganizationAuthorizationId,
    ) -> StoreResult<Option<OrganizationAuthorization>> {
        let found = self.block_on(self.fetch_org_auths(
            "get_organization_authorization_by_id",
            "id = $1",
            &[*id.as_uuid()],
            &[],
        ))?;
        Ok(found.into_iter().next())
    }

    fn list_organization_authorizations(
        &self,
        organization_id: OrganizationId,
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        self.block_on(self.fetch_org_auths(
            "list_organization_authorizations",
            "organization_id = $1",
            &[*organization_id.as_uuid()],
            &[],
        ))
    }

    fn list_organization_authorizations_for_user(
        &self,
        email: &str,
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        self.block_on(self.fetch_org_auths(
            "list_organization_authorizations_for_user",
            "user_email = $1",
            &[],
            &[email],
        ))
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    fn delete_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<OrganizationAuthorization>> {
        self.block_on(async {
            let sql = format!(
                "DELETE FROM organization_authorizations \
                 WHERE organization_id = $1 AND user_email = $2 RETURNING {ORG_AUTH_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(*organization_id.as_uuid())
                .bind(email)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_organization_authorization", e))?;
            row.as_ref().map(org_auth_from_row).transpose()
        })
    }

    #[instrument(skip(self), err)]
    fn set_has_2fa_for_user(
        &self,
        email: &str,
        has_2fa: bool,
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        self.block_on(async {
            let sql = format!(
                "UPDATE organization_authorizations SET has_2fa = $2, updated_at = now() \
                 WHERE user_email = $1 AND has_2fa <> $2 RETURNING {ORG_AUTH_COLUMNS}"
            );
            let rows = sqlx::query(&sql)
                .bind(email)
                .bind(has_2fa)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("set_has_2fa_for_user", e))?;
            rows.iter().map(org_auth_from_row).collect()
        })
    }

    #[instrument(skip(self, project, user, organization_authorization), fields(project_id = %project.id, user_email = %user.email), err)]
    fn upsert_project_authorization(
        &self,
        project: &Project,
        user: &User,
        role: ProjectRole,
        organization_authorization: &OrganizationAuthorization,
    ) -> StoreResult<Upserted<ProjectAuthorization>> {
        self.block_on(async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sqlx_error("acquire", e))?;
            upsert_project_auth(&mut conn, project, user, role, organization_authorization).await
        })
    }

    fn get_project_authorization(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<ProjectAuthorization>> {
        let found = self.block_on(self.fetch_project_auths(
            "get_project_authorization",
            "project_id = $1 AND user_email = $2",
            &[*project_id.as_uuid()],
            &[email],
        ))?;
        Ok(found.into_iter().next())
    }

    fn list_project_authorizations(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Vec<ProjectAuthorization>> {
        self.block_on(self.fetch_project_auths(
            "list_project_authorizations",
            "project_id = $1",
            &[*project_id.as_uuid()],
            &[],
        ))
    }

    fn list_project_authorizations_for_user(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Vec<ProjectAuthorization>> {
        self.block_on(self.fetch_project_auths(
            "list_project_authorizations_for_user",
            "organization_id = $1 AND user_email = $2",
            &[*organization_id.as_uuid()],
            &[email],
        ))
    }

    #[instrument(skip(self), fields(project_id = %project_id), err)]
    fn delete_project_authorization(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<ProjectRemoval>> {
        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let sql = format!(
                "DELETE FROM project_authorizations \
                 WHERE project_id = $1 AND user_email = $2 RETURNING {PROJECT_AUTH_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(*project_id.as_uuid())
                .bind(email)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_project_authorization", e))?;

            let Some(row) = row else {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Ok(None);
            };
            let removed = project_auth_from_row(&row)?;

            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM project_authorizations WHERE organization_authorization_id = $1",
            )
            .bind(*removed.organization_authorization_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count_project_authorizations", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;

            Ok(Some(ProjectRemoval {
                removed,
                remaining: usize::try_from(remaining).unwrap_or(0),
            }))
        })
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    fn upsert_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
        role: OrganizationRole,
        created_by: UserId,
    ) -> StoreResult<Upserted<RequestPermissionOrganization>> {
        self.block_on(async {
            let sql = format!(
                r#"
                INSERT INTO request_permission_organizations (id, organization_id, email, role, created_by)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (organization_id, email) DO UPDATE SET role = EXCLUDED.role
                RETURNING {ORG_INVITE_COLUMNS}, (xmax = 0) AS inserted
                "#
            );
            let row = sqlx::query(&sql)
                .bind(*RequestPermissionId::new().as_uuid())
                .bind(*organization_id.as_uuid())
                .bind(email)
                .bind(role.code())
                .bind(*created_by.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("upsert_organization_invite", e))?;
            upserted(&row, org_invite_from_row)
        })
    }

    #[instrument(skip(self, project), fields(project_id = %project.id), err)]
    fn upsert_project_invite(
        &self,
        project: &Project,
        email: &str,
        role: ProjectRole,
        created_by: UserId,
    ) -> StoreResult<Upserted<RequestPermissionProject>> {
        self.block_on(async {
            let sql = format!(
                r#"
                INSERT INTO request_permission_projects (id, project_id, organization_id, email, role, created_by)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (project_id, email) DO UPDATE SET role = EXCLUDED.role
                RETURNING {PROJECT_INVITE_COLUMNS}, (xmax = 0) AS inserted
                "#
            );
            let row = sqlx::query(&sql)
                .bind(*RequestPermissionId::new().as_uuid())
                .bind(*project.id.as_uuid())
                .bind(*project.organization_id.as_uuid())
                .bind(email)
                .bind(role.code())
                .bind(*created_by.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("upsert_project_invite", e))?;
            upserted(&row, project_invite_from_row)
        })
    }

    fn get_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<RequestPermissionOrganization>> {
        let found = self.block_on(self.fetch_org_invites(
            "get_organization_invite",
            "organization_id = $1 AND email = $2",
            &[*organization_id.as_uuid()],
            &[email],
        ))?;
        Ok(found.into_iter().next())
    }

    fn get_project_invite(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<RequestPermissionProject>> {
        let found = self.block_on(self.fetch_project_invites(
            "get_project_invite",
            "project_id = $1 AND email = $2",
            &[*project_id.as_uuid()],
            &[email],
        ))?;
        Ok(found.into_iter().next())
    }

    fn list_organization_invites(
        &self,
        organization_id: OrganizationId,
    ) -> StoreResult<Vec<RequestPermissionOrganization>> {
        self.block_on(self.fetch_org_invites(
            "list_organization_invites",
            "organization_id = $1",
            &[*organization_id.as_uuid()],
            &[],
        ))
    }

    fn list_project_invites(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Vec<RequestPermissionProject>> {
        self.block_on(self.fetch_project_invites(
            "list_project_invites",
            "project_id = $1",
            &[*project_id.as_uuid()],
            &[],
        ))
    }

    fn list_organization_invites_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Vec<RequestPermissionOrganization>> {
        self.block_on(self.fetch_org_invites(
            "list_organization_invites_for_email",
            "email = $1",
            &[],
            &[email],
        ))
    }

    fn list_project_invites_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Vec<RequestPermissionProject>> {
        self.block_on(self.fetch_project_invites(
            "list_project_invites_for_email",
            "email = $1",
            &[],
            &[email],
        ))
    }

    fn delete_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<bool> {
        self.block_on(async {
            let result = sqlx::query(
                "DELETE FROM request_permission_organizations WHERE organization_id = $1 AND email = $2",
            )
            .bind(*organization_id.as_uuid())
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_organization_invite", e))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn delete_project_invite(&self, project_id: ProjectId, email: &str) -> StoreResult<bool> {
        self.block_on(async {
            let result = sqlx::query(
                "DELETE FROM request_permission_projects WHERE project_id = $1 AND email = $2",
            )
            .bind(*project_id.as_uuid())
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_project_invite", e))?;
            Ok(result.rows_affected() > 0)
        })
    }

    #[instrument(skip(self, invite, user), fields(organization_id = %invite.organization_id, user_email = %user.email), err)]
    fn materialize_organization_invite(
        &self,
        invite: &RequestPermissionOrganization,
        user: &User,
        role: OrganizationRole,
    ) -> StoreResult<Upserted<OrganizationAuthorization>> {
        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let upserted =
                upsert_org_auth(&mut tx, user, invite.organization_id, role, user.has_2fa).await?;

            sqlx::query("DELETE FROM request_permission_organizations WHERE id = $1")
                .bind(*invite.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_organization_invite", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(upserted)
        })
    }

    #[instrument(skip(self, invite, user, project), fields(project_id = %project.id, user_email = %user.email), err)]
    fn materialize_project_invite(
        &self,
        invite: &RequestPermissionProject,
        user: &User,
        project: &Project,
    ) -> StoreResult<ProjectMaterialization> {
        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let organization = ensure_org_auth(&mut tx, user, project.organization_id).await?;
            let project_auth =
                upsert_project_auth(&mut tx, project, user, invite.role, organization.record())
                    .await?;

            sqlx::query("DELETE FROM request_permission_projects WHERE id = $1")
                .bind(*invite.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_project_invite", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;

            Ok(ProjectMaterialization {
                organization,
                project: project_auth,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_upsert_conflict_target() {
        for key in [
            "UNIQUE (organization_id, user_email)",
            "UNIQUE (project_id, user_email)",
            "UNIQUE (organization_id, email)",
            "UNIQUE (project_id, email)",
        ] {
            assert!(SCHEMA.contains(key), "missing {key}");
        }
        assert!(SCHEMA.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn sqlx_errors_name_the_operation() {
        let err = map_sqlx_error("delete_project_authorization", sqlx::Error::PoolClosed);
        assert!(err.to_string().contains("delete_project_authorization"));

        let err = map_sqlx_error("ensure_schema", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Backend(msg) if msg.contains("ensure_schema")));
    }

    #[test]
    fn unknown_role_codes_are_backend_errors() {
        assert!(matches!(organization_role(42), Err(StoreError::Backend(_))));
        assert_eq!(project_role(1).unwrap(), ProjectRole::Moderator);
    }
}
