use async_trait::async_trait;
use depmig_core::{Division, NormalizedAsset, NormalizedReport, Scalar};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::reconcile::{ReportStore, StoreError};

// Keeps every INSERT under the Postgres bind-parameter ceiling.
const ASSET_ROWS_PER_STATEMENT: usize = 1_000;

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn encoded(value: &Option<Scalar>) -> Option<String> {
    value.as_ref().map(Scalar::encoded)
}

fn push_division_40_rows(builder: &mut QueryBuilder<'_, Postgres>, report_id: i64, rows: &[NormalizedAsset]) {
    builder.push(
        "INSERT INTO div40_assets (report_id, name, area, installation_date_formula, rate_formula, \
         quantity_formula, scrapped_date_formula, is_given_cost, depreciation_method, \
         is_division_43_deduction, number_of_items, exclude_fees, exclude_expenditure) ",
    );
    builder.push_values(rows, |mut row, asset| {
        let plant = asset.plant.as_ref();
        row.push_bind(report_id)
            .push_bind(asset.name.clone())
            .push_bind(asset.area.as_str())
            .push_bind(asset.installation_date_formula.as_ref().map(|v| v.encoded()))
            .push_bind(encoded(&asset.rate_formula))
            .push_bind(encoded(&asset.quantity_formula))
            .push_bind(asset.scrapped_date_formula.as_ref().map(|v| v.encoded()))
            .push_bind(asset.is_given_cost)
            .push_bind(plant.map(|p| p.depreciation_method.as_str()))
            .push_bind(plant.map(|p| p.is_division_43_deduction))
            .push_bind(plant.and_then(|p| encoded(&p.number_of_items)))
            .push_bind(plant.map(|p| p.exclude_fees))
            .push_bind(plant.map(|p| p.exclude_expenditure));
    });
}

fn push_division_43_rows(builder: &mut QueryBuilder<'_, Postgres>, report_id: i64, rows: &[NormalizedAsset]) {
    builder.push(
        "INSERT INTO div43_assets (report_id, name, area, installation_date_formula, rate_formula, \
         quantity_formula, scrapped_date_formula, is_given_cost) ",
    );
    builder.push_values(rows, |mut row, asset| {
        row.push_bind(report_id)
            .push_bind(asset.name.clone())
            .push_bind(asset.area.as_str())
            .push_bind(asset.installation_date_formula.as_ref().map(|v| v.encoded()))
            .push_bind(encoded(&asset.rate_formula))
            .push_bind(encoded(&asset.quantity_formula))
            .push_bind(asset.scrapped_date_formula.as_ref().map(|v| v.encoded()))
            .push_bind(asset.is_given_cost);
    });
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn find_report_by_reference(&self, reference: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
              FROM reports
             WHERE reference = $1
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn delete_report(&self, report_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM div40_assets WHERE report_id = $1")
            .bind(report_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM div43_assets WHERE report_id = $1")
            .bind(report_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM reports WHERE id = $1")
            .bind(report_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_report(&self, report: &NormalizedReport, crm_deal_id: &str) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO reports (
                reference, report_date, crm_deal_id, years_in_schedule,
                pre_notional_write_down_years, notional_write_down_rate,
                notional_write_down_governor, preliminary_fees, expenditure_governor,
                consultancy_fees, number_of_years_to_back_claim
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&report.reference)
        .bind(report.report_date)
        .bind(crm_deal_id)
        .bind(encoded(&report.years_in_schedule))
        .bind(encoded(&report.pre_notional_write_down_years))
        .bind(encoded(&report.notional_write_down_rate))
        .bind(encoded(&report.notional_write_down_governor))
        .bind(encoded(&report.preliminary_fees))
        .bind(encoded(&report.expenditure_governor))
        .bind(encoded(&report.consultancy_fees))
        .bind(encoded(&report.number_of_years_to_back_claim))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn bulk_insert_assets(
        &self,
        division: Division,
        report_id: i64,
        assets: &[NormalizedAsset],
    ) -> Result<u64, StoreError> {
        if assets.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in assets.chunks(ASSET_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Postgres>::new("");
            match division {
                Division::Div40 => push_division_40_rows(&mut builder, report_id, chunk),
                Division::Div43 => push_division_43_rows(&mut builder, report_id, chunk),
            }
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}
