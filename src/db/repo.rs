use super::model::{NewCandidate, NewOpportunity, OpportunityStatus, Page};
use crate::model::{Candidate, CandidateNote, CandidateStatus, ChatPost, JobOpp, Opportunity};
use crate::stage::Stage;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::instrument;

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opportunity {id} was modified concurrently (expected version {version})")]
    Conflict { id: i64, version: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

const OPP_COLUMNS: &str = "id, remote_id, candidate_id, job_opp_id, name, stage, last_active_stage, \
     closed, won, next_step, next_step_due_date, closing_comments, \
     closing_comments_for_candidate, employer_feedback, version, created_at, updated_at";

const CANDIDATE_COLUMNS: &str = "id, candidate_number, first_name, last_name, partner_id, status, \
     all_notifications, relocated_country, created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
pub async fn init_memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Expands a leading `~/` in file-backed SQLite URLs and creates the parent
/// directory. In-memory and non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    // Strip optional // and split off query parameters.
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn opportunity_from_row(row: &SqliteRow) -> Result<Opportunity> {
    let stage: String = row.try_get("stage")?;
    let stage = Stage::parse_stage(&stage)
        .ok_or_else(|| anyhow!("unknown stage {stage:?} in candidate_opps"))?;
    let last_active_stage = row
        .try_get::<Option<String>, _>("last_active_stage")?
        .as_deref()
        .and_then(Stage::parse_stage);
    Ok(Opportunity {
        id: row.try_get("id")?,
        remote_id: row.try_get("remote_id")?,
        candidate_id: row.try_get("candidate_id")?,
        job_opp_id: row.try_get("job_opp_id")?,
        name: row.try_get("name")?,
        stage,
        last_active_stage,
        closed: row.try_get("closed")?,
        won: row.try_get("won")?,
        next_step: row.try_get("next_step")?,
        next_step_due_date: row.try_get("next_step_due_date")?,
        closing_comments: row.try_get("closing_comments")?,
        closing_comments_for_candidate: row.try_get("closing_comments_for_candidate")?,
        employer_feedback: row.try_get("employer_feedback")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn candidate_from_row(row: &SqliteRow) -> Result<Candidate> {
    let status: String = row.try_get("status")?;
    let status = CandidateStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("unknown candidate status {status:?}"))?;
    Ok(Candidate {
        id: row.try_get("id")?,
        candidate_number: row.try_get("candidate_number")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        partner_id: row.try_get("partner_id")?,
        status,
        all_notifications: row.try_get("all_notifications")?,
        relocated_country: row.try_get("relocated_country")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_opp_from_row(row: &SqliteRow) -> Result<JobOpp> {
    Ok(JobOpp {
        id: row.try_get("id")?,
        remote_id: row.try_get("remote_id")?,
        name: row.try_get("name")?,
        country: row.try_get("country")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip_all)]
pub async fn find_opportunity_by_id(pool: &Pool, id: i64) -> Result<Option<Opportunity>> {
    let row = sqlx::query(&format!("SELECT {OPP_COLUMNS} FROM candidate_opps WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(opportunity_from_row).transpose()
}

#[instrument(skip_all, fields(remote_id = remote_id))]
pub async fn find_opportunity_by_remote_id(
    pool: &Pool,
    remote_id: &str,
) -> Result<Option<Opportunity>> {
    let row = sqlx::query(&format!(
        "SELECT {OPP_COLUMNS} FROM candidate_opps WHERE remote_id = ?"
    ))
    .bind(remote_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(opportunity_from_row).transpose()
}

/// Remote ids of every linked, still-open opportunity, oldest first.
#[instrument(skip_all)]
pub async fn find_open_opportunity_remote_ids(pool: &Pool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT remote_id FROM candidate_opps WHERE closed = 0 AND remote_id IS NOT NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn find_opportunities_by_ids(
    pool: &Pool,
    ids: &[i64],
    page: Page,
) -> Result<Vec<Opportunity>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {OPP_COLUMNS} FROM candidate_opps WHERE id IN ("
    ));
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
    qb.push(") ORDER BY id LIMIT ")
        .push_bind(i64::from(page.size))
        .push(" OFFSET ")
        .push_bind(page.offset());
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(opportunity_from_row).collect()
}

#[instrument(skip_all)]
pub async fn find_opportunities_by_status(
    pool: &Pool,
    status: OpportunityStatus,
    page: Page,
) -> Result<Vec<Opportunity>> {
    let rows = sqlx::query(&format!(
        "SELECT {OPP_COLUMNS} FROM candidate_opps WHERE closed = ? ORDER BY id LIMIT ? OFFSET ?"
    ))
    .bind(status.is_closed())
    .bind(i64::from(page.size))
    .bind(page.offset())
    .fetch_all(pool)
    .await?;
    rows.iter().map(opportunity_from_row).collect()
}

#[instrument(skip_all)]
pub async fn insert_opportunity(pool: &Pool, new: &NewOpportunity) -> Result<i64> {
    let now = Utc::now();
    let last_active = (!new.stage.is_closed()).then(|| new.stage.as_str());
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO candidate_opps (remote_id, candidate_id, job_opp_id, name, stage, stage_order, \
         last_active_stage, closed, won, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&new.remote_id)
    .bind(new.candidate_id)
    .bind(new.job_opp_id)
    .bind(&new.name)
    .bind(new.stage.as_str())
    .bind(new.stage.ordinal() as i64)
    .bind(last_active)
    .bind(new.stage.is_closed())
    .bind(new.stage.is_won())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert opportunity")?;
    Ok(id)
}

/// Writes every mutable column of `opp` if nobody saved it since it was read.
/// Returns the stored record with its bumped version.
#[instrument(skip_all, fields(id = opp.id, version = opp.version))]
pub async fn save_opportunity(pool: &Pool, opp: &Opportunity) -> Result<Opportunity, StoreError> {
    // The version match is the whole conflict check; no row means another writer won.
    let res = sqlx::query(
        "UPDATE candidate_opps SET remote_id = ?, name = ?, stage = ?, stage_order = ?, \
         last_active_stage = ?, closed = ?, won = ?, next_step = ?, next_step_due_date = ?, \
         closing_comments = ?, closing_comments_for_candidate = ?, employer_feedback = ?, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ?",
    )
    .bind(&opp.remote_id)
    .bind(&opp.name)
    .bind(opp.stage.as_str())
    .bind(opp.stage.ordinal() as i64)
    .bind(opp.last_active_stage.map(|s| s.as_str()))
    .bind(opp.closed)
    .bind(opp.won)
    .bind(&opp.next_step)
    .bind(opp.next_step_due_date)
    .bind(&opp.closing_comments)
    .bind(&opp.closing_comments_for_candidate)
    .bind(&opp.employer_feedback)
    .bind(opp.updated_at)
    .bind(opp.id)
    .bind(opp.version)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::Conflict {
            id: opp.id,
            version: opp.version,
        });
    }
    // Mirror the bump done in SQL.
    let mut saved = opp.clone();
    saved.version += 1;
    Ok(saved)
}

#[instrument(skip_all)]
pub async fn insert_candidate(pool: &Pool, new: &NewCandidate) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO candidates (candidate_number, first_name, last_name, partner_id, status, all_notifications) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&new.candidate_number)
    .bind(&new.first_name)
    .bind(&new.last_name)
    .bind(new.partner_id)
    .bind(new.status.as_str())
    .bind(new.all_notifications)
    .fetch_one(pool)
    .await
    .context("failed to insert candidate")?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn find_candidate_by_id(pool: &Pool, id: i64) -> Result<Option<Candidate>> {
    let row = sqlx::query(&format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(candidate_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn find_candidate_by_number(pool: &Pool, number: &str) -> Result<Option<Candidate>> {
    let row = sqlx::query(&format!(
        "SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE candidate_number = ?"
    ))
    .bind(number)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(candidate_from_row).transpose()
}

async fn insert_note_tx(
    tx: &mut Transaction<'_, Sqlite>,
    candidate_id: i64,
    title: &str,
    comment: &str,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO candidate_notes (candidate_id, title, comment, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(candidate_id)
    .bind(title)
    .bind(comment)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn insert_candidate_note(
    pool: &Pool,
    candidate_id: i64,
    title: &str,
    comment: &str,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = insert_note_tx(&mut tx, candidate_id, title, comment).await?;
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn list_candidate_notes(pool: &Pool, candidate_id: i64) -> Result<Vec<CandidateNote>> {
    let rows = sqlx::query(
        "SELECT id, candidate_id, title, comment, created_at FROM candidate_notes WHERE candidate_id = ? ORDER BY id",
    )
    .bind(candidate_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(CandidateNote {
                id: row.try_get("id")?,
                candidate_id: row.try_get("candidate_id")?,
                title: row.try_get("title")?,
                comment: row.try_get("comment")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Stores the relocation country and its audit note together.
#[instrument(skip_all, fields(candidate_id = candidate_id))]
pub async fn set_candidate_relocated_country(
    pool: &Pool,
    candidate_id: i64,
    country: &str,
    note_title: &str,
    note_comment: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE candidates SET relocated_country = ?, updated_at = ? WHERE id = ?")
        .bind(country)
        .bind(Utc::now())
        .bind(candidate_id)
        .execute(&mut *tx)
        .await?;
    // A failed note drops the transaction and rolls the update back.
    insert_note_tx(&mut tx, candidate_id, note_title, note_comment).await?;
    tx.commit()
        .await
        .context("failed to record relocation country")?;
    Ok(())
}

/// Stores the candidate status and its audit note together.
#[instrument(skip_all, fields(candidate_id = candidate_id))]
pub async fn set_candidate_status(
    pool: &Pool,
    candidate_id: i64,
    status: CandidateStatus,
    note_title: &str,
    note_comment: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE candidates SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(candidate_id)
        .execute(&mut *tx)
        .await?;
    insert_note_tx(&mut tx, candidate_id, note_title, note_comment).await?;
    tx.commit()
        .await
        .context("failed to record candidate status")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_job_opp_by_id(pool: &Pool, id: i64) -> Result<Option<JobOpp>> {
    let row = sqlx::query(
        "SELECT id, remote_id, name, country, created_at, updated_at FROM job_opps WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_opp_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn find_job_opp_by_remote_id(pool: &Pool, remote_id: &str) -> Result<Option<JobOpp>> {
    let row = sqlx::query(
        "SELECT id, remote_id, name, country, created_at, updated_at FROM job_opps WHERE remote_id = ?",
    )
    .bind(remote_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_opp_from_row).transpose()
}

/// Creates or refreshes a job; a missing country keeps the stored one.
#[instrument(skip_all)]
pub async fn upsert_job_opp(
    pool: &Pool,
    remote_id: &str,
    name: &str,
    country: Option<&str>,
) -> Result<i64> {
    let now = Utc::now();
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO job_opps (remote_id, name, country, created_at, updated_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(remote_id) DO UPDATE SET name = excluded.name, \
         country = COALESCE(excluded.country, job_opps.country), updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(remote_id)
    .bind(name)
    .bind(country)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert job")?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn insert_chat_post(pool: &Pool, chat_key: &str, content: &str) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO chat_posts (chat_key, content, created_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(chat_key)
    .bind(content)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert chat post")?;
    Ok(id)
}

/// Posts in insertion order, optionally limited to one chat.
#[instrument(skip_all)]
pub async fn list_chat_posts(pool: &Pool, chat_key: Option<&str>) -> Result<Vec<ChatPost>> {
    let rows = match chat_key {
        Some(key) => {
            sqlx::query(
                "SELECT id, chat_key, content, created_at FROM chat_posts WHERE chat_key = ? ORDER BY id",
            )
            .bind(key)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT id, chat_key, content, created_at FROM chat_posts ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter()
        .map(|row| {
            Ok(ChatPost {
                id: row.try_get("id")?,
                chat_key: row.try_get("chat_key")?,
                content: row.try_get("content")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn get_sync_watermark(pool: &Pool, job_name: &str) -> Result<Option<DateTime<Utc>>> {
    let mark = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT watermark FROM sync_cursor WHERE job_name = ?",
    )
    .bind(job_name)
    .fetch_optional(pool)
    .await?;
    Ok(mark)
}

#[instrument(skip_all)]
pub async fn set_sync_watermark(pool: &Pool, job_name: &str, mark: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_cursor (job_name, watermark, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(job_name) DO UPDATE SET watermark = excluded.watermark, updated_at = excluded.updated_at",
    )
    .bind(job_name)
    .bind(mark)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Takes the named lease when it is free or expired. Times are epoch millis.
#[instrument(skip_all, fields(name = name))]
pub async fn try_acquire_lock(
    pool: &Pool,
    name: &str,
    owner: &str,
    now_ms: i64,
    until_ms: i64,
) -> Result<bool> {
    // Insert a fresh row, or take over an existing one only once it has
    // expired. A live lease leaves the row alone and affects nothing.
    let res = sqlx::query(
        "INSERT INTO job_locks (name, locked_until, locked_at, locked_by) VALUES (?, ?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET locked_until = excluded.locked_until, \
         locked_at = excluded.locked_at, locked_by = excluded.locked_by \
         WHERE job_locks.locked_until <= excluded.locked_at",
    )
    .bind(name)
    .bind(until_ms)
    .bind(now_ms)
    .bind(owner)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Ends the lease early if `owner` still holds it.
#[instrument(skip_all, fields(name = name))]
pub async fn release_lock(pool: &Pool, name: &str, owner: &str, now_ms: i64) -> Result<bool> {
    // Expire the lease now instead of deleting it, and only for the owner of
    // a lease that is still live.
    let res = sqlx::query(
        "UPDATE job_locks SET locked_until = ? WHERE name = ? AND locked_by = ? AND locked_until > ?",
    )
    .bind(now_ms)
    .bind(name)
    .bind(owner)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(pool: &Pool) -> (i64, i64) {
        let cid = insert_candidate(pool, &NewCandidate::new("1234")).await.unwrap();
        let jid = upsert_job_opp(pool, "a0J1", "Nurse", Some("Canada"))
            .await
            .unwrap();
        (cid, jid)
    }

    #[tokio::test]
    async fn save_bumps_version_and_detects_conflict() {
        let pool = init_memory_pool().await.unwrap();
        let (cid, jid) = seed(&pool).await;
        let id = insert_opportunity(
            &pool,
            &NewOpportunity {
                remote_id: Some("006A".into()),
                candidate_id: cid,
                job_opp_id: jid,
                name: Some("case".into()),
                stage: Stage::Prospect,
            },
        )
        .await
        .unwrap();

        let mut opp = find_opportunity_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(opp.version, 0);
        assert_eq!(opp.last_active_stage, Some(Stage::Prospect));
        let stale = opp.clone();

        opp.stage = Stage::CvReview;
        let saved = save_opportunity(&pool, &opp).await.unwrap();
        assert_eq!(saved.version, 1);

        let err = save_opportunity(&pool, &stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { id: i, version: 0 } if i == id));

        let reread = find_opportunity_by_remote_id(&pool, "006A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reread.stage, Stage::CvReview);
        assert_eq!(reread.version, 1);
    }

    #[tokio::test]
    async fn open_ids_and_paged_finds() {
        let pool = init_memory_pool().await.unwrap();
        let (cid, _) = seed(&pool).await;
        let mut ids = vec![];
        for i in 0..5 {
            let jid = upsert_job_opp(&pool, &format!("job{i}"), "Job", None)
                .await
                .unwrap();
            let stage = if i == 2 { Stage::NoVisa } else { Stage::Prospect };
            let id = insert_opportunity(
                &pool,
                &NewOpportunity {
                    remote_id: (i != 4).then(|| format!("006{i}")),
                    candidate_id: cid,
                    job_opp_id: jid,
                    name: None,
                    stage,
                },
            )
            .await
            .unwrap();
            ids.push(id);
        }

        let open = find_open_opportunity_remote_ids(&pool).await.unwrap();
        assert_eq!(open, vec!["0060", "0061", "0063"]);

        let page = find_opportunities_by_ids(&pool, &ids, Page::new(1, 2))
            .await
            .unwrap();
        assert_eq!(page.iter().map(|o| o.id).collect::<Vec<_>>(), ids[2..4]);

        let closed = find_opportunities_by_status(&pool, OpportunityStatus::Closed, Page::new(0, 10))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].closed);
        assert_eq!(closed[0].last_active_stage, None);

        assert!(find_opportunities_by_ids(&pool, &[], Page::new(0, 10))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn upsert_job_keeps_country_when_missing() {
        let pool = init_memory_pool().await.unwrap();
        let (_, jid) = seed(&pool).await;
        let again = upsert_job_opp(&pool, "a0J1", "Senior Nurse", None)
            .await
            .unwrap();
        assert_eq!(again, jid);
        let job = find_job_opp_by_remote_id(&pool, "a0J1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.name, "Senior Nurse");
        assert_eq!(job.country.as_deref(), Some("Canada"));
    }

    #[tokio::test]
    async fn relocation_and_status_write_notes() {
        let pool = init_memory_pool().await.unwrap();
        let (cid, _) = seed(&pool).await;
        set_candidate_relocated_country(&pool, cid, "Canada", "Relocated", "to Canada")
            .await
            .unwrap();
        set_candidate_status(&pool, cid, CandidateStatus::Employed, "Status", "employed")
            .await
            .unwrap();
        let c = find_candidate_by_number(&pool, "1234").await.unwrap().unwrap();
        assert_eq!(c.relocated_country.as_deref(), Some("Canada"));
        assert_eq!(c.status, CandidateStatus::Employed);
        let notes = list_candidate_notes(&pool, cid).await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].title, "Relocated");
    }

    #[tokio::test]
    async fn failed_note_rolls_back_relocation() {
        let pool = init_memory_pool().await.unwrap();
        let (cid, _) = seed(&pool).await;
        sqlx::query("DROP TABLE candidate_notes")
            .execute(&pool)
            .await
            .unwrap();
        assert!(
            set_candidate_relocated_country(&pool, cid, "Canada", "Relocated", "to Canada")
                .await
                .is_err()
        );
        let c = find_candidate_by_id(&pool, cid).await.unwrap().unwrap();
        assert_eq!(c.relocated_country, None);
    }

    #[tokio::test]
    async fn expired_lease_row_can_be_released_only_while_live() {
        let pool = init_memory_pool().await.unwrap();
        assert!(try_acquire_lock(&pool, "job", "a", 1_000, 2_000).await.unwrap());
        assert!(!release_lock(&pool, "job", "a", 2_000).await.unwrap());
        assert!(try_acquire_lock(&pool, "job", "a", 2_000, 3_000).await.unwrap());
    }

    #[tokio::test]
    async fn watermark_round_trip() {
        let pool = init_memory_pool().await.unwrap();
        assert!(get_sync_watermark(&pool, "changed").await.unwrap().is_none());
        let mark = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        set_sync_watermark(&pool, "changed", mark).await.unwrap();
        set_sync_watermark(&pool, "changed", mark).await.unwrap();
        assert_eq!(get_sync_watermark(&pool, "changed").await.unwrap(), Some(mark));
    }

    #[tokio::test]
    async fn lock_lease_semantics() {
        let pool = init_memory_pool().await.unwrap();
        assert!(try_acquire_lock(&pool, "job", "a", 1_000, 5_000).await.unwrap());
        assert!(!try_acquire_lock(&pool, "job", "b", 2_000, 6_000).await.unwrap());
        assert!(!release_lock(&pool, "job", "b", 2_500).await.unwrap());
        assert!(release_lock(&pool, "job", "a", 3_000).await.unwrap());
        assert!(try_acquire_lock(&pool, "job", "b", 3_000, 7_000).await.unwrap());
        // expired lease is taken over
        assert!(try_acquire_lock(&pool, "job", "c", 7_000, 9_000).await.unwrap());
    }

    #[tokio::test]
    async fn chat_posts_filter_by_key() {
        let pool = init_memory_pool().await.unwrap();
        insert_chat_post(&pool, "candidate-prospect:1", "hello").await.unwrap();
        insert_chat_post(&pool, "candidate-recruiting:2:1", "hi").await.unwrap();
        assert_eq!(list_chat_posts(&pool, None).await.unwrap().len(), 2);
        let one = list_chat_posts(&pool, Some("candidate-prospect:1"))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].content, "hello");
    }

    #[test]
    fn memory_urls_untouched() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }
}
