//! Generic persistence over one entity table.
//!
//! Every statement runs on the unit of work's session. Reads bump the
//! session's query counter. A failed write rolls the session back before the
//! translated error is returned, so callers never see a raw `sqlx` error and
//! never continue on a poisoned transaction.

use super::entity::{column_list, Entity};
use super::query::{
    bind_value, push_order_by, push_value, push_where, resolve_column, Fields, FilterNode,
    Page, Pagination, QueryOptions, SortBy, SqlValue,
};
use crate::error::{read_error, write_error, BillingError, BillingResult};
use crate::services::metrics::start_query_timer;
use crate::uow::Session;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub struct BaseRepository<E: Entity> {
    session: Arc<Session>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for BaseRepository<E> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> BaseRepository<E> {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            _entity: PhantomData,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn select() -> QueryBuilder<'static, Postgres> {
        QueryBuilder::new(format!("SELECT {} FROM {}", column_list::<E>(), E::TABLE))
    }

    fn operation(op: &str) -> String {
        format!("{}_{}", op, E::TABLE)
    }

    async fn fetch_optional(
        &self,
        mut qb: QueryBuilder<'_, Postgres>,
        op: &str,
    ) -> BillingResult<Option<E>> {
        let timer = start_query_timer(&Self::operation(op));
        let mut conn = self.session.read().await?;
        let row = qb
            .build_query_as::<E>()
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| read_error(&format!("{} {}", op, E::NAME), e))?;
        timer.observe_duration();
        Ok(row)
    }

    async fn fetch_all(&self, mut qb: QueryBuilder<'_, Postgres>, op: &str) -> BillingResult<Vec<E>> {
        let timer = start_query_timer(&Self::operation(op));
        let mut conn = self.session.read().await?;
        let rows = qb
            .build_query_as::<E>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| read_error(&format!("{} {}", op, E::NAME), e))?;
        timer.observe_duration();
        debug!(table = E::TABLE, rows = rows.len(), "Fetched rows");
        Ok(rows)
    }

    async fn fetch_scalar<T>(&self, mut qb: QueryBuilder<'_, Postgres>, op: &str) -> BillingResult<T>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, PgRow>,
    {
        let timer = start_query_timer(&Self::operation(op));
        let mut conn = self.session.read().await?;
        let value = qb
            .build_query_scalar::<T>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| read_error(&format!("{} {}", op, E::NAME), e))?;
        timer.observe_duration();
        Ok(value)
    }

    /// Translate a failed write and roll the session back.
    async fn write_failed(&self, err: sqlx::Error) -> BillingError {
        let error = write_error(E::NAME, err);
        if let Err(rollback_err) = self.session.rollback().await {
            warn!(entity = E::NAME, error = %rollback_err, "Rollback after failed write also failed");
        }
        warn!(entity = E::NAME, error = %error, "Write failed, transaction rolled back");
        error
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get_by_id(&self, id: i64) -> BillingResult<Option<E>> {
        let mut qb = Self::select();
        qb.push(" WHERE id = ").push_bind(id);
        self.fetch_optional(qb, "get_by_id").await
    }

    pub async fn get_by_id_or_fail(&self, id: i64) -> BillingResult<E> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| BillingError::not_found(E::NAME, id))
    }

    /// Load a row and lock it until the transaction ends.
    pub async fn get_for_update(&self, id: i64) -> BillingResult<Option<E>> {
        let mut qb = Self::select();
        qb.push(" WHERE id = ").push_bind(id).push(" FOR UPDATE");
        self.fetch_optional(qb, "get_for_update").await
    }

    pub async fn get_many(&self, ids: &[i64]) -> BillingResult<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = Self::select();
        qb.push(" WHERE id = ANY(")
            .push_bind(ids.to_vec())
            .push(") ORDER BY id");
        self.fetch_all(qb, "get_many").await
    }

    pub async fn get_all(&self, options: &QueryOptions) -> BillingResult<Vec<E>> {
        let mut qb = Self::select();
        push_where(&mut qb, E::NAME, E::COLUMNS, &options.filters)?;
        push_order_by(&mut qb, E::NAME, E::COLUMNS, &options.sort)?;
        if let Some(limit) = options.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        if options.lock_for_update {
            qb.push(" FOR UPDATE");
        }
        self.fetch_all(qb, "get_all").await
    }

    /// Count over the filtered set, then fetch one page of it.
    pub async fn get_page(
        &self,
        pagination: Pagination,
        options: &QueryOptions,
    ) -> BillingResult<Page<E>> {
        let mut count = QueryBuilder::new(format!("SELECT COUNT(*) FROM (SELECT id FROM {}", E::TABLE));
        push_where(&mut count, E::NAME, E::COLUMNS, &options.filters)?;
        count.push(") AS filtered");
        let total = self.fetch_scalar::<i64>(count, "count_page").await?;

        let mut qb = Self::select();
        push_where(&mut qb, E::NAME, E::COLUMNS, &options.filters)?;
        if options.sort.is_empty() {
            // stable pages need a total order
            push_order_by(&mut qb, E::NAME, E::COLUMNS, &[SortBy::asc("id")])?;
        } else {
            push_order_by(&mut qb, E::NAME, E::COLUMNS, &options.sort)?;
        }
        qb.push(" LIMIT ")
            .push_bind(pagination.limit())
            .push(" OFFSET ")
            .push_bind(pagination.offset());
        if options.lock_for_update {
            qb.push(" FOR UPDATE");
        }
        let items = self.fetch_all(qb, "get_page").await?;

        Ok(Page::new(items, total, pagination))
    }

    /// First row matching all criteria. List values match by membership.
    pub async fn find_one(&self, criteria: Fields) -> BillingResult<Option<E>> {
        let mut qb = Self::select();
        push_where(&mut qb, E::NAME, E::COLUMNS, &criteria.into_filters())?;
        qb.push(" ORDER BY id LIMIT 1");
        self.fetch_optional(qb, "find_one").await
    }

    pub async fn find_many(&self, criteria: Fields) -> BillingResult<Vec<E>> {
        let mut qb = Self::select();
        push_where(&mut qb, E::NAME, E::COLUMNS, &criteria.into_filters())?;
        qb.push(" ORDER BY id");
        self.fetch_all(qb, "find_many").await
    }

    pub async fn count(&self, filters: &[FilterNode]) -> BillingResult<i64> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", E::TABLE));
        push_where(&mut qb, E::NAME, E::COLUMNS, filters)?;
        self.fetch_scalar::<i64>(qb, "count").await
    }

    pub async fn exists(&self, filters: &[FilterNode]) -> BillingResult<bool> {
        let mut qb = QueryBuilder::new(format!("SELECT EXISTS (SELECT 1 FROM {}", E::TABLE));
        push_where(&mut qb, E::NAME, E::COLUMNS, filters)?;
        qb.push(")");
        self.fetch_scalar::<bool>(qb, "exists").await
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert a row; columns not given take their database defaults.
    #[instrument(skip(self, fields), fields(entity = E::NAME))]
    pub async fn create(&self, fields: Fields) -> BillingResult<E> {
        let mut qb = QueryBuilder::new(format!("INSERT INTO {}", E::TABLE));
        if fields.is_empty() {
            qb.push(" DEFAULT VALUES");
        } else {
            qb.push(" (");
            for (i, (column, _)) in fields.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(resolve_column(E::NAME, E::COLUMNS, column)?);
            }
            qb.push(") VALUES (");
            for (i, (_, value)) in fields.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(&mut qb, value)?;
            }
            qb.push(")");
        }
        qb.push(" RETURNING ").push(column_list::<E>());

        let timer = start_query_timer(&Self::operation("create"));
        let result = {
            let mut conn = self.session.connection().await?;
            qb.build_query_as::<E>().fetch_one(&mut *conn).await
        };
        timer.observe_duration();

        match result {
            Ok(row) => {
                debug!(entity = E::NAME, id = row.id(), "Row created");
                Ok(row)
            }
            Err(e) => Err(self.write_failed(e).await),
        }
    }

    pub async fn create_many(&self, rows: Vec<Fields>) -> BillingResult<Vec<E>> {
        let mut created = Vec::with_capacity(rows.len());
        for fields in rows {
            created.push(self.create(fields).await?);
        }
        Ok(created)
    }

    /// Partial update. `None` when the row does not exist.
    #[instrument(skip(self, fields), fields(entity = E::NAME, id = id))]
    pub async fn update(&self, id: i64, fields: Fields) -> BillingResult<Option<E>> {
        if fields.is_empty() {
            return self.get_by_id(id).await;
        }

        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", E::TABLE));
        push_assignments(&mut qb, E::NAME, E::COLUMNS, &fields)?;
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING ").push(column_list::<E>());

        let timer = start_query_timer(&Self::operation("update"));
        let result = {
            let mut conn = self.session.connection().await?;
            qb.build_query_as::<E>().fetch_optional(&mut *conn).await
        };
        timer.observe_duration();

        match result {
            Ok(row) => Ok(row),
            Err(e) => Err(self.write_failed(e).await),
        }
    }

    /// Bulk update of every row matching `filters`. Unfiltered updates are refused.
    #[instrument(skip(self, filters, fields), fields(entity = E::NAME))]
    pub async fn update_many(&self, filters: &[FilterNode], fields: Fields) -> BillingResult<u64> {
        if filters.is_empty() {
            return Err(BillingError::validation(format!(
                "Refusing to update every {} row",
                E::NAME
            )));
        }
        if fields.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", E::TABLE));
        push_assignments(&mut qb, E::NAME, E::COLUMNS, &fields)?;
        push_where(&mut qb, E::NAME, E::COLUMNS, filters)?;

        let timer = start_query_timer(&Self::operation("update_many"));
        let result = {
            let mut conn = self.session.connection().await?;
            qb.build().execute(&mut *conn).await
        };
        timer.observe_duration();

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.write_failed(e).await),
        }
    }

    pub async fn delete(&self, id: i64) -> BillingResult<bool> {
        Ok(self.delete_many(&[id]).await? > 0)
    }

    #[instrument(skip(self, ids), fields(entity = E::NAME, count = ids.len()))]
    pub async fn delete_many(&self, ids: &[i64]) -> BillingResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE id = ANY(", E::TABLE));
        qb.push_bind(ids.to_vec()).push(")");

        let timer = start_query_timer(&Self::operation("delete_many"));
        let result = {
            let mut conn = self.session.connection().await?;
            qb.build().execute(&mut *conn).await
        };
        timer.observe_duration();

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.write_failed(e).await),
        }
    }

    /// Escape hatch for statements the builder cannot express. Positional
    /// parameters (`$1`, `$2`, ...) are bound from `params` in order.
    #[instrument(skip(self, sql, params), fields(entity = E::NAME))]
    pub async fn execute_raw(&self, sql: &str, params: Vec<SqlValue>) -> BillingResult<u64> {
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value)?;
        }

        let timer = start_query_timer(&Self::operation("execute_raw"));
        let result = {
            let mut conn = self.session.connection().await?;
            query.execute(&mut *conn).await
        };
        timer.observe_duration();

        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.write_failed(e).await),
        }
    }
}

fn push_assignments(
    qb: &mut QueryBuilder<'_, Postgres>,
    entity: &str,
    columns: &'static [&'static str],
    fields: &Fields,
) -> BillingResult<()> {
    for (i, (column, value)) in fields.iter().enumerate() {
        let column = resolve_column(entity, columns, column)?;
        if column == "id" {
            return Err(BillingError::validation("The id column cannot be updated"));
        }
        if i > 0 {
            qb.push(", ");
        }
        qb.push(column).push(" = ");
        push_value(qb, value)?;
    }
    Ok(())
}
