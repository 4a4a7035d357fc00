//! Postgres adapters over `sqlx`. Rates are `NUMERIC(10,2)` in the schema and travel as
//! `float8` on the wire.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use eggrates_core::{CityEntity, CityStatePair, CitySummary, NormalizedRate, PairSummary, RateRecord};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use crate::{NormalizedStore, NormalizedTx, PrimaryStore, PrimaryTx, Storage, StoreError};

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    // never log the DSN, it carries credentials
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        info!("connected to db");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }

    pub fn storage(&self) -> Storage {
        Storage::new(
            PgPrimary {
                pool: self.pool.clone(),
            },
            PgNormalized {
                pool: self.pool.clone(),
            },
        )
    }
}

fn rate_record(row: &PgRow) -> Result<RateRecord, StoreError> {
    Ok(RateRecord {
        id: row.try_get("id")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        date: row.try_get("date")?,
        rate: row.try_get("rate")?,
    })
}

fn normalized_rate(row: &PgRow) -> Result<NormalizedRate, StoreError> {
    Ok(NormalizedRate {
        id: row.try_get("id")?,
        city_id: row.try_get("city_id")?,
        date: row.try_get("date")?,
        rate: row.try_get("rate")?,
    })
}

pub struct PgPrimary {
    pool: PgPool,
}

#[async_trait]
impl PrimaryStore for PgPrimary {
    async fn pair_summaries(&self) -> Result<Vec<PairSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT city, state,
                   COUNT(*) AS rate_count,
                   MIN(date) AS earliest_date,
                   MAX(date) AS latest_date
              FROM egg_rates
             GROUP BY city, state
             ORDER BY city, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let rate_count: i64 = row.try_get("rate_count")?;
            out.push(PairSummary {
                city: row.try_get("city")?,
                state: row.try_get("state")?,
                rate_count: rate_count.max(0) as u64,
                earliest_date: row.try_get("earliest_date")?,
                latest_date: row.try_get("latest_date")?,
            });
        }
        Ok(out)
    }

    async fn rates_for_pair(&self, city: &str, state: &str) -> Result<Vec<RateRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, city, state, date, rate::float8 AS rate
              FROM egg_rates
             WHERE city = $1 AND state = $2
             ORDER BY date, id
            "#,
        )
        .bind(city)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rate_record).collect()
    }

    async fn begin(&self) -> Result<Box<dyn PrimaryTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgPrimaryTx { tx }))
    }

    async fn pending_sync(&self) -> Result<Vec<CityStatePair>, StoreError> {
        let rows = sqlx::query("SELECT city, state FROM sync_outbox ORDER BY city, state")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CityStatePair {
                city: row.try_get("city")?,
                state: row.try_get("state")?,
            });
        }
        Ok(out)
    }

    async fn clear_sync(&self, pairs: &[CityStatePair]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut cleared = 0;
        for pair in pairs {
            let done = sqlx::query("DELETE FROM sync_outbox WHERE city = $1 AND state = $2")
                .bind(&pair.city)
                .bind(&pair.state)
                .execute(&mut *tx)
                .await?;
            cleared += done.rows_affected();
        }
        tx.commit().await?;
        Ok(cleared)
    }
}

struct PgPrimaryTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PrimaryTx for PgPrimaryTx {
    async fn rates_for_pair(
        &mut self,
        city: &str,
        state: &str,
    ) -> Result<Vec<RateRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, city, state, date, rate::float8 AS rate
              FROM egg_rates
             WHERE city = $1 AND state = $2
             ORDER BY date, id
            "#,
        )
        .bind(city)
        .bind(state)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(rate_record).collect()
    }

    async fn rate_exists(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM egg_rates WHERE city = $1 AND state = $2 AND date = $3)",
        )
        .bind(city)
        .bind(state)
        .bind(date)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_rate(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
        rate: f64,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO egg_rates (city, state, date, rate) VALUES ($1, $2, $3, $4::float8) RETURNING id",
        )
        .bind(city)
        .bind(state)
        .bind(date)
        .bind(rate)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn update_rate(
        &mut self,
        city: &str,
        state: &str,
        date: NaiveDate,
        rate: f64,
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE egg_rates SET rate = $1::float8 WHERE city = $2 AND state = $3 AND date = $4",
        )
        .bind(rate)
        .bind(city)
        .bind(state)
        .bind(date)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected())
    }

    async fn delete_pair(&mut self, city: &str, state: &str) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM egg_rates WHERE city = $1 AND state = $2")
            .bind(city)
            .bind(state)
            .execute(&mut *self.tx)
            .await?;
        Ok(done.rows_affected())
    }

    async fn rename_pair(
        &mut self,
        from_city: &str,
        to_city: &str,
        state: &str,
    ) -> Result<u64, StoreError> {
        let done = sqlx::query("UPDATE egg_rates SET city = $1 WHERE city = $2 AND state = $3")
            .bind(to_city)
            .bind(from_city)
            .bind(state)
            .execute(&mut *self.tx)
            .await?;
        Ok(done.rows_affected())
    }

    async fn enqueue_sync(&mut self, pair: &CityStatePair) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_outbox (city, state) VALUES ($1, $2) ON CONFLICT (city, state) DO NOTHING",
        )
        .bind(&pair.city)
        .bind(&pair.state)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

pub struct PgNormalized {
    pool: PgPool,
}

#[async_trait]
impl NormalizedStore for PgNormalized {
    async fn city_summaries(&self) -> Result<Vec<CitySummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.state_id, s.name AS state_name,
                   COUNT(r.id) AS rate_count
              FROM cities c
              JOIN states s ON s.id = c.state_id
              LEFT JOIN egg_rates_normalized r ON r.city_id = c.id
             GROUP BY c.id, c.name, c.state_id, s.name
             ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let rate_count: i64 = row.try_get("rate_count")?;
            out.push(CitySummary {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                state_id: row.try_get("state_id")?,
                state_name: row.try_get("state_name")?,
                rate_count: rate_count.max(0) as u64,
            });
        }
        Ok(out)
    }

    async fn begin(&self) -> Result<Box<dyn NormalizedTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgNormalizedTx { tx }))
    }
}

struct PgNormalizedTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl NormalizedTx for PgNormalizedTx {
    async fn cities(&mut self) -> Result<Vec<CityEntity>, StoreError> {
        let rows = sqlx::query("SELECT id, name, state_id FROM cities ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CityEntity {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                state_id: row.try_get("state_id")?,
            });
        }
        Ok(out)
    }

    async fn rename_city(&mut self, city_id: i64, name: &str) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE cities SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(city_id)
            .execute(&mut *self.tx)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("city {city_id}")));
        }
        Ok(())
    }

    async fn rates_for_city(&mut self, city_id: i64) -> Result<Vec<NormalizedRate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, city_id, date, rate::float8 AS rate
              FROM egg_rates_normalized
             WHERE city_id = $1
             ORDER BY date, id
            "#,
        )
        .bind(city_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(normalized_rate).collect()
    }

    async fn move_rate(&mut self, rate_id: i64, to_city_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE egg_rates_normalized SET city_id = $1 WHERE id = $2")
            .bind(to_city_id)
            .bind(rate_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_rate(&mut self, rate_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM egg_rates_normalized WHERE id = $1")
            .bind(rate_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_city(&mut self, city_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cities WHERE id = $1")
            .bind(city_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn ensure_state(&mut self, name: &str) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO states (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn ensure_city(&mut self, name: &str, state_id: i64) -> Result<i64, StoreError> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM cities WHERE name = $1 AND state_id = $2 ORDER BY id LIMIT 1",
        )
        .bind(name)
        .bind(state_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let id: i64 =
            sqlx::query_scalar("INSERT INTO cities (name, state_id) VALUES ($1, $2) RETURNING id")
                .bind(name)
                .bind(state_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(id)
    }

    async fn upsert_rate(
        &mut self,
        city_id: i64,
        date: NaiveDate,
        rate: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO egg_rates_normalized (city_id, date, rate)
            VALUES ($1, $2, $3::float8)
            ON CONFLICT (city_id, date) DO UPDATE SET rate = EXCLUDED.rate
            "#,
        )
        .bind(city_id)
        .bind(date)
        .bind(rate)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
