//! Postgres-backed [`KpiStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::debug;

use super::{JobLogRecord, KpiStore, ValueRow};
use crate::frame::Value;

pub struct PgKpiStore {
    pool: PgPool,
    schema: Option<String>,
}

impl PgKpiStore {
    pub fn new(pool: PgPool, schema: Option<String>) -> Self {
        Self { pool, schema }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
            None => quote_ident(table),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_value<'a>(
    builder: &mut sqlx::query_builder::Separated<'_, 'a, sqlx::Postgres, &'static str>,
    value: &'a Value,
) {
    match value {
        Value::Null => {
            builder.push_bind(Option::<String>::None);
        }
        Value::Bool(b) => {
            builder.push_bind(*b);
        }
        Value::Number(n) => {
            builder.push_bind(n.into_inner());
        }
        Value::Text(s) => {
            builder.push_bind(s.as_str());
        }
        Value::Timestamp(ts) => {
            builder.push_bind(*ts);
        }
    }
}

#[async_trait]
impl KpiStore for PgKpiStore {
    async fn ensure_job_log(&self, table: &str) -> anyhow::Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                object_type VARCHAR(255),
                object_name VARCHAR(255),
                schedule VARCHAR(255),
                last_update TIMESTAMPTZ,
                trace VARCHAR(2000)
            )",
            self.qualified(table)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn last_execution(
        &self,
        table: &str,
        object_type: &str,
        object_name: &str,
        schedule: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX(last_update) AS last_update FROM {}
             WHERE object_type = $1 AND object_name = $2 AND schedule = $3",
            self.qualified(table)
        );
        let row = sqlx::query(&sql)
            .bind(object_type)
            .bind(object_name)
            .bind(schedule)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("last_update")?)
    }

    async fn record_completion(&self, table: &str, record: &JobLogRecord) -> anyhow::Result<()> {
        let sql = format!(
            "INSERT INTO {} (object_type, object_name, schedule, last_update, trace)
             VALUES ($1, $2, $3, $4, $5)",
            self.qualified(table)
        );
        sqlx::query(&sql)
            .bind(&record.object_type)
            .bind(&record.object_name)
            .bind(&record.schedule)
            .bind(record.last_update)
            .bind(record.trace.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_window(
        &self,
        table: &str,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let qualified = self.qualified(table);
        let result = match start_ts {
            Some(start) => {
                let sql = format!(
                    "DELETE FROM {qualified} WHERE \"TIMESTAMP\" >= $1 AND \"TIMESTAMP\" < $2"
                );
                sqlx::query(&sql)
                    .bind(start)
                    .bind(end_ts)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("DELETE FROM {qualified} WHERE \"TIMESTAMP\" < $1");
                sqlx::query(&sql).bind(end_ts).execute(&self.pool).await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn insert_values(
        &self,
        table: &str,
        dimensions: &[String],
        rows: &[ValueRow],
    ) -> anyhow::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut columns = String::from("\"KEY\"");
        for dim in dimensions {
            columns.push_str(", ");
            columns.push_str(&quote_ident(dim));
        }
        columns.push_str(", \"VALUE_B\", \"VALUE_N\", \"VALUE_S\", \"VALUE_T\", \"LAST_UPDATE\"");

        let mut builder: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({columns}) ",
            self.qualified(table)
        ));
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.key.as_str());
            for value in &row.dimensions {
                bind_value(&mut b, value);
            }
            b.push_bind(row.value_b);
            b.push_bind(row.value_n);
            b.push_bind(row.value_s.as_deref());
            b.push_bind(row.value_t);
            b.push("NOW()");
        });

        let result = builder.build().execute(&self.pool).await?;
        debug!(table, rows = rows.len(), "bulk insert executed");
        Ok(result.rows_affected())
    }
}

// These tests need a live database; they are skipped unless DATABASE_URL is
// set, matching how the rest of the storage layer is exercised in CI.
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    async fn connect() -> Option<PgPool> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping Postgres store test");
            return None;
        };
        Some(
            PgPoolOptions::new()
                .max_connections(2)
                .connect(&url)
                .await
                .expect("failed to connect to test database"),
        )
    }

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn job_log_round_trip() {
        let Some(pool) = connect().await else { return };
        let store = PgKpiStore::new(pool.clone(), None);
        let table = format!("job_log_{}", Uuid::new_v4().simple());

        store.ensure_job_log(&table).await.unwrap();
        assert_eq!(
            store
                .last_execution(&table, "entity_type", "pump", "5min")
                .await
                .unwrap(),
            None
        );

        for hour in [9, 10] {
            store
                .record_completion(
                    &table,
                    &JobLogRecord {
                        object_type: "entity_type".into(),
                        object_name: "pump".into(),
                        schedule: "5min".into(),
                        last_update: ts(hour),
                        trace: None,
                    },
                )
                .await
                .unwrap();
        }

        let last = store
            .last_execution(&table, "entity_type", "pump", "5min")
            .await
            .unwrap();
        assert_eq!(last, Some(ts(10)));

        sqlx::query(&format!("DROP TABLE {}", quote_ident(&table)))
            .execute(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_then_insert_is_idempotent() {
        let Some(pool) = connect().await else { return };
        let store = PgKpiStore::new(pool.clone(), None);
        let table = format!("kpi_values_{}", Uuid::new_v4().simple());
        sqlx::query(&format!(
            "CREATE TABLE {} (
                \"KEY\" VARCHAR(255),
                \"ENTITY_ID\" VARCHAR(255),
                \"TIMESTAMP\" TIMESTAMPTZ,
                \"VALUE_B\" SMALLINT,
                \"VALUE_N\" DOUBLE PRECISION,
                \"VALUE_S\" VARCHAR(255),
                \"VALUE_T\" TIMESTAMPTZ,
                \"LAST_UPDATE\" TIMESTAMPTZ
            )",
            quote_ident(&table)
        ))
        .execute(&pool)
        .await
        .unwrap();

        let dims = vec!["ENTITY_ID".to_string(), "TIMESTAMP".to_string()];
        let rows = vec![ValueRow {
            key: "temp".into(),
            dimensions: vec![Value::text("a"), Value::Timestamp(ts(10))],
            value_n: Some(3.7),
            ..ValueRow::default()
        }];

        for _ in 0..2 {
            store
                .delete_window(&table, Some(ts(9)), ts(11))
                .await
                .unwrap();
            let written = store.insert_values(&table, &dims, &rows).await.unwrap();
            assert_eq!(written, rows.len() as u64);
        }

        let count: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {}",
            quote_ident(&table)
        ))
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("n")
        .unwrap();
        assert_eq!(count, 1);

        sqlx::query(&format!("DROP TABLE {}", quote_ident(&table)))
            .execute(&pool)
            .await
            .unwrap();
    }
}
