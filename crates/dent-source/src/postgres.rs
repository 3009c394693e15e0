//! Postgres-backed reader.
//!
//! One query per concern: the changed-rows stream computes the services
//! summary and the weighted total in the same projection (no per-row round
//! trips), and plan lines are fetched only on demand by the projector.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use dent_model::{Appointment, AppointmentStatus, ChangeMarkers, ExternalId, TreatmentPlanLine};

use crate::reader::{AppointmentSource, AppointmentStream};
use crate::SourceError;

/// Changed-rows selection. The OR over the six markers mirrors the change
/// envelope; `greatest(coalesce(..))` orders rows by their maximum marker
/// so the watermark can advance mid-cycle. All comparisons are `>=`.
const READ_SINCE_SQL: &str = r#"
select a.id, a.patient_name, a.patient_phone, a.doctor_name, a.planned_start, a.status,
       a.added_at, a.changed_at, a.patient_arrived_at, a.started_at, a.ended_at, a.cancelled_at,
       string_agg(s.name, ', ' order by s.id)                 as services,
       sum(s.unit_price * s.count - s.discount)               as total_amount
from appointments a
left join appointment_services s on s.appointment_id = a.id
where a.filial_id = $1
  and a.status between 0 and 5
  and (   a.added_at           >= $2
       or a.changed_at         >= $2
       or a.patient_arrived_at >= $2
       or a.started_at         >= $2
       or a.ended_at           >= $2
       or a.cancelled_at       >= $2)
group by a.id
order by greatest(
    coalesce(a.added_at,           'epoch'::timestamptz),
    coalesce(a.changed_at,         'epoch'::timestamptz),
    coalesce(a.patient_arrived_at, 'epoch'::timestamptz),
    coalesce(a.started_at,         'epoch'::timestamptz),
    coalesce(a.ended_at,           'epoch'::timestamptz),
    coalesce(a.cancelled_at,       'epoch'::timestamptz)
) asc, a.id asc
"#;

const PLAN_LINES_SQL: &str = r#"
select id, name, count, unit_price, discount
from treatment_plan_lines
where appointment_id = $1
order by id asc
"#;

pub struct PgAppointmentSource {
    pool: PgPool,
    filial_id: u8,
}

impl PgAppointmentSource {
    /// Build the pool without touching the network. The first query pays
    /// for the connection; daemon startup must not block (or fail) on a
    /// temporarily unreachable clinic database. Every session gets a
    /// `statement_timeout` so a wedged query surfaces as
    /// [`SourceError::Unavailable`] instead of hanging the cycle.
    pub fn connect_lazy(
        url: &str,
        filial_id: u8,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let timeout_ms = query_timeout.as_millis().max(1);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(connect_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::Executor::execute(
                        &mut *conn,
                        format!("set statement_timeout = {timeout_ms}").as_str(),
                    )
                    .await?;
                    Ok(())
                })
            })
            .connect_lazy(url)
            .map_err(|e| SourceError::Unavailable(format!("connect: {e}")))?;
        Ok(Self { pool, filial_id })
    }

    pub fn from_pool(pool: PgPool, filial_id: u8) -> Self {
        Self { pool, filial_id }
    }
}

#[async_trait]
impl AppointmentSource for PgAppointmentSource {
    fn read_since(&self, watermark: DateTime<Utc>) -> AppointmentStream<'_> {
        let filial_id = self.filial_id;
        sqlx::query(READ_SINCE_SQL)
            .bind(i16::from(self.filial_id))
            .bind(watermark)
            .fetch(&self.pool)
            .map(move |res| match res {
                Ok(row) => appointment_from_row(&row, filial_id),
                Err(e) => Err(SourceError::Unavailable(format!("read_since: {e}"))),
            })
            .boxed()
    }

    async fn read_plan_lines(
        &self,
        external_id: &ExternalId,
    ) -> Result<Vec<TreatmentPlanLine>, SourceError> {
        let (_, row_id) = external_id
            .parts()
            .ok_or_else(|| SourceError::Decode(format!("bad external id: {external_id}")))?;
        let rows = sqlx::query(PLAN_LINES_SQL)
            .bind(row_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SourceError::Unavailable(format!("read_plan_lines: {e}")))?;
        rows.iter().map(plan_line_from_row).collect()
    }

    async fn ping(&self) -> bool {
        sqlx::query_as::<_, (i32,)>("select 1")
            .fetch_one(&self.pool)
            .await
            .map(|(one,)| one == 1)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn appointment_from_row(row: &PgRow, filial_id: u8) -> Result<Appointment, SourceError> {
    let decode = |what: &str, e: sqlx::Error| SourceError::Decode(format!("{what}: {e}"));

    let status_code: i16 = row.try_get("status").map_err(|e| decode("status", e))?;
    let status = AppointmentStatus::from_code(status_code)
        .ok_or_else(|| SourceError::Decode(format!("unknown status code {status_code}")))?;

    Ok(Appointment {
        filial_id,
        row_id: row.try_get("id").map_err(|e| decode("id", e))?,
        patient_name: row
            .try_get("patient_name")
            .map_err(|e| decode("patient_name", e))?,
        patient_phone: row
            .try_get::<Option<String>, _>("patient_phone")
            .map_err(|e| decode("patient_phone", e))?
            .unwrap_or_default(),
        doctor_name: row
            .try_get::<Option<String>, _>("doctor_name")
            .map_err(|e| decode("doctor_name", e))?
            .unwrap_or_default(),
        planned_start: row
            .try_get("planned_start")
            .map_err(|e| decode("planned_start", e))?,
        status,
        services: row.try_get("services").map_err(|e| decode("services", e))?,
        total_amount: row
            .try_get("total_amount")
            .map_err(|e| decode("total_amount", e))?,
        markers: ChangeMarkers {
            added_at: row.try_get("added_at").map_err(|e| decode("added_at", e))?,
            changed_at: row
                .try_get("changed_at")
                .map_err(|e| decode("changed_at", e))?,
            patient_arrived_at: row
                .try_get("patient_arrived_at")
                .map_err(|e| decode("patient_arrived_at", e))?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| decode("started_at", e))?,
            ended_at: row.try_get("ended_at").map_err(|e| decode("ended_at", e))?,
            cancelled_at: row
                .try_get("cancelled_at")
                .map_err(|e| decode("cancelled_at", e))?,
        },
    })
}

fn plan_line_from_row(row: &PgRow) -> Result<TreatmentPlanLine, SourceError> {
    let decode = |what: &str, e: sqlx::Error| SourceError::Decode(format!("plan line {what}: {e}"));
    Ok(TreatmentPlanLine {
        line_id: row.try_get("id").map_err(|e| decode("id", e))?,
        name: row.try_get("name").map_err(|e| decode("name", e))?,
        count: row
            .try_get::<i32, _>("count")
            .map_err(|e| decode("count", e))?
            .max(0) as u32,
        unit_price: row
            .try_get("unit_price")
            .map_err(|e| decode("unit_price", e))?,
        discount: row
            .try_get::<Option<f64>, _>("discount")
            .map_err(|e| decode("discount", e))?
            .unwrap_or(0.0),
    })
}
