use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{
    Alert, ErrorEntry, HotTag, Page, PageRequest, ProcessStatus, RunCounts, RunRecord, RunStatus,
    Schedule, Scope, RuleSet, Settings, Task, Template, VideoRecord, VideoSort,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{
    AlertRepository, RunRepository, SettingsRepository, StoreError, TaskFilter, TaskRepository,
    TemplateRepository, VideoFilter, VideoRepository,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn enum_text<T: Serialize>(column: &'static str, value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::Corrupt {
            column,
            message: format!("expected a string tag, got {other}"),
        }),
        Err(err) => Err(StoreError::Corrupt {
            column,
            message: err.to_string(),
        }),
    }
}

fn text_enum<T: DeserializeOwned>(column: &'static str, raw: String) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|err| StoreError::Corrupt {
        column,
        message: err.to_string(),
    })
}

fn json_col<T: DeserializeOwned>(row: &PgRow, column: &'static str) -> Result<T, StoreError> {
    let Json(value) = row.try_get::<Json<T>, _>(column)?;
    Ok(value)
}

fn offset(page: PageRequest) -> i64 {
    page.offset() as i64
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        keywords: json_col::<Vec<String>>(row, "keywords")?,
        exclude_words: json_col::<Vec<String>>(row, "exclude_words")?,
        tags: json_col::<Vec<String>>(row, "tags")?,
        scope: json_col::<Scope>(row, "scope")?,
        schedule: json_col::<Schedule>(row, "schedule")?,
        rules: json_col::<RuleSet>(row, "rules")?,
        status: text_enum("status", row.try_get("status")?)?,
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures")?.max(0) as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    Ok(RunRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        trigger: text_enum("trigger_kind", row.try_get("trigger_kind")?)?,
        status: text_enum("status", row.try_get("status")?)?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
        duration_ms: row
            .try_get::<Option<i64>, _>("duration_ms")?
            .map(|ms| ms.max(0) as u64),
        counts: json_col::<RunCounts>(row, "counts")?,
        error_summary: row.try_get("error_summary")?,
        error_detail: json_col::<Vec<ErrorEntry>>(row, "error_detail")?,
        retry_of: row.try_get("retry_of")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert, StoreError> {
    Ok(Alert {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        kind: text_enum("kind", row.try_get("kind")?)?,
        level: text_enum("level", row.try_get("level")?)?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        meta: json_col::<serde_json::Value>(row, "meta")?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template, StoreError> {
    Ok(Template {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        industry: row.try_get("industry")?,
        strength: text_enum("strength", row.try_get("strength")?)?,
        rules: json_col::<RuleSet>(row, "rules")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const TASK_COLUMNS: &str = "id, name, keywords, exclude_words, tags, scope, schedule, rules, \
     status, consecutive_failures, created_at, updated_at";

const RUN_COLUMNS: &str = "id, task_id, trigger_kind, status, start_at, end_at, duration_ms, \
     counts, error_summary, error_detail, retry_of";

const ALERT_COLUMNS: &str =
    "id, task_id, kind, level, title, message, meta, created_at, read_at";

#[async_trait]
impl TaskRepository for PgStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, keywords, exclude_words, tags, scope, schedule, rules,
                               status, consecutive_failures, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(Json(&task.keywords))
        .bind(Json(&task.exclude_words))
        .bind(Json(&task.tags))
        .bind(Json(&task.scope))
        .bind(Json(&task.schedule))
        .bind(Json(&task.rules))
        .bind(task.status.as_str())
        .bind(task.consecutive_failures as i32)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
               SET name = $2,
                   keywords = $3,
                   exclude_words = $4,
                   tags = $5,
                   scope = $6,
                   schedule = $7,
                   rules = $8,
                   status = $9,
                   updated_at = $10
             WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(Json(&task.keywords))
        .bind(Json(&task.exclude_words))
        .bind(Json(&task.tags))
        .bind(Json(&task.scope))
        .bind(Json(&task.schedule))
        .bind(Json(&task.rules))
        .bind(task.status.as_str())
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", task.id));
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<Task>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let pattern = filter
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{q}%"));

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
              FROM tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR name ILIKE $2 OR keywords::text ILIKE $2)
            "#,
        )
        .bind(status)
        .bind(pattern.as_deref())
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
              FROM tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR name ILIKE $2 OR keywords::text ILIKE $2)
             ORDER BY updated_at DESC, id
             LIMIT $3 OFFSET $4
            "#
        ))
        .bind(status)
        .bind(pattern.as_deref())
        .bind(page.page_size as i64)
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(task_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            page_size: page.page_size,
            total: total.max(0) as u64,
        })
    }

    async fn enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'enabled'"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bump_failure_streak(&self, id: Uuid) -> Result<(u32, u32), StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
               SET consecutive_failures = consecutive_failures + 1
             WHERE id = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("task", id))?;
        let current = row.try_get::<i32, _>("consecutive_failures")?.max(1) as u32;
        Ok((current - 1, current))
    }

    async fn reset_failure_streak(&self, id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks t
               SET consecutive_failures = 0
              FROM (SELECT id, consecutive_failures AS previous
                      FROM tasks
                     WHERE id = $1
                       FOR UPDATE) old
             WHERE t.id = old.id
            RETURNING old.previous
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("task", id))?;
        Ok(row.try_get::<i32, _>("previous")?.max(0) as u32)
    }
}

#[async_trait]
impl RunRepository for PgStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, task_id, trigger_kind, status, start_at, end_at, duration_ms,
                              counts, error_summary, error_detail, retry_of)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(run.task_id)
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.start_at)
        .bind(run.end_at)
        .bind(run.duration_ms.map(|ms| ms as i64))
        .bind(Json(&run.counts))
        .bind(run.error_summary.as_deref())
        .bind(Json(&run.error_detail))
        .bind(run.retry_of)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::ActiveRunExists {
                    task_id: run.task_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
               SET status = $2,
                   end_at = $3,
                   duration_ms = $4,
                   counts = $5,
                   error_summary = $6,
                   error_detail = $7
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.end_at)
        .bind(run.duration_ms.map(|ms| ms as i64))
        .bind(Json(&run.counts))
        .bind(run.error_summary.as_deref())
        .bind(Json(&run.error_detail))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_run(run.id).await? {
            Some(_) => Err(StoreError::RunFinalized(run.id)),
            None => Err(StoreError::not_found("run", run.id)),
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        task_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<RunRecord>, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM runs WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM runs
             WHERE task_id = $1
             ORDER BY start_at DESC
             LIMIT $2 OFFSET $3
            "#
        ))
        .bind(task_id)
        .bind(page.page_size as i64)
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(run_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            page_size: page.page_size,
            total: total.max(0) as u64,
        })
    }

    async fn active_run(&self, task_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = $1 AND status = $2"
        ))
        .bind(task_id)
        .bind(RunStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn scheduled_run_since(
        &self,
        task_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM runs
                 WHERE task_id = $1
                   AND trigger_kind = 'schedule'
                   AND start_at >= $2
            ) AS fired
            "#,
        )
        .bind(task_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("fired")?)
    }

    async fn fail_running_run(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
               SET status = 'failed',
                   end_at = $2,
                   duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM ($2 - start_at)) * 1000)::BIGINT),
                   error_summary = $3
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn abandon_running_runs(
        &self,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
               SET status = 'failed',
                   end_at = $1,
                   duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM ($1 - start_at)) * 1000)::BIGINT),
                   error_summary = $2
             WHERE status = 'running'
            "#,
        )
        .bind(now)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl VideoRepository for PgStore {
    async fn upsert_video(&self, task_id: Uuid, video: &VideoRecord) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO videos (bvid, record, fetch_time)
            VALUES ($1, $2, $3)
            ON CONFLICT (bvid) DO UPDATE
               SET record = EXCLUDED.record || jsonb_build_object(
                       'process_status', COALESCE(videos.record->'process_status', '"todo"'::jsonb),
                       'note', COALESCE(videos.record->'note', 'null'::jsonb)),
                   fetch_time = EXCLUDED.fetch_time
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&video.bvid)
        .bind(Json(video))
        .bind(video.fetch_time)
        .fetch_one(&mut *tx)
        .await?;
        let inserted: bool = row.try_get("inserted")?;

        sqlx::query(
            r#"
            INSERT INTO task_videos (task_id, bvid, first_seen)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_id, bvid) DO NOTHING
            "#,
        )
        .bind(task_id)
        .bind(&video.bvid)
        .bind(video.fetch_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_video(&self, bvid: &str) -> Result<Option<VideoRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT v.record,
                   COALESCE(array_agg(tv.task_id) FILTER (WHERE tv.task_id IS NOT NULL), '{}') AS task_ids
              FROM videos v
              LEFT JOIN task_videos tv ON tv.bvid = v.bvid
             WHERE v.bvid = $1
             GROUP BY v.bvid
            "#,
        )
        .bind(bvid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(video_from_row(&row)?))
    }

    async fn list_videos(
        &self,
        filter: &VideoFilter,
        sort: VideoSort,
        page: PageRequest,
    ) -> Result<Page<VideoRecord>, StoreError> {
        let total: i64 = bind_video_filter(
            sqlx::query(&format!(
                "SELECT COUNT(*) AS total FROM videos v WHERE {VIDEO_FILTER}"
            )),
            filter,
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let sql = format!(
            r#"
            SELECT v.record,
                   COALESCE((SELECT array_agg(tv.task_id) FROM task_videos tv WHERE tv.bvid = v.bvid), '{{}}') AS task_ids
              FROM videos v
             WHERE {VIDEO_FILTER}
             ORDER BY {order} DESC NULLS LAST, v.bvid
             LIMIT $17 OFFSET $18
            "#,
            order = sort_column(sort),
        );
        let rows = bind_video_filter(sqlx::query(&sql), filter)
            .bind(page.page_size as i64)
            .bind(offset(page))
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows.iter().map(video_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            page_size: page.page_size,
            total: total.max(0) as u64,
        })
    }

    async fn set_video_process_status(
        &self,
        bvid: &str,
        status: ProcessStatus,
    ) -> Result<VideoRecord, StoreError> {
        self.patch_video(bvid, "process_status", serde_json::json!(status.as_str()))
            .await
    }

    async fn set_video_note(
        &self,
        bvid: &str,
        note: Option<String>,
    ) -> Result<VideoRecord, StoreError> {
        self.patch_video(bvid, "note", serde_json::json!(note)).await
    }

    async fn list_tags(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT btrim(tag) AS tag
              FROM (
                    SELECT jsonb_array_elements_text(tags) AS tag FROM tasks
                    UNION ALL
                    SELECT jsonb_array_elements_text(record->'tags') AS tag FROM videos
                   ) t
             WHERE btrim(tag) <> ''
             ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("tag").map_err(StoreError::from))
            .collect()
    }
}

/// Shared WHERE clause for video listings; binds `$1..=$16` in
/// [`bind_video_filter`] order.
const VIDEO_FILTER: &str = r#"
    ($1::uuid IS NULL OR EXISTS (
        SELECT 1 FROM task_videos tv WHERE tv.bvid = v.bvid AND tv.task_id = $1))
    AND ($2::text IS NULL OR (v.record->$2->>'is_hit')::boolean)
    AND ($3::text IS NULL OR COALESCE(v.record->>'process_status', 'todo') = $3)
    AND ($4::timestamptz IS NULL OR (v.record->>'publish_time')::timestamptz >= $4)
    AND ($5::timestamptz IS NULL OR (v.record->>'publish_time')::timestamptz <= $5)
    AND ($6::timestamptz IS NULL OR v.fetch_time >= $6)
    AND ($7::timestamptz IS NULL OR v.fetch_time <= $7)
    AND ($8::bigint IS NULL OR (v.record->'stats'->>'views')::bigint >= $8)
    AND ($9::bigint IS NULL OR (v.record->'stats'->>'fav')::bigint >= $9)
    AND ($10::bigint IS NULL OR (v.record->'stats'->>'coin')::bigint >= $10)
    AND ($11::bigint IS NULL OR (v.record->'stats'->>'reply')::bigint >= $11)
    AND ($12::float8 IS NULL OR (v.record->'rates'->>'fav_rate')::float8 >= $12)
    AND ($13::float8 IS NULL OR (v.record->'rates'->>'coin_rate')::float8 >= $13)
    AND ($14::float8 IS NULL OR (v.record->'rates'->>'reply_rate')::float8 >= $14)
    AND ($15::float8 IS NULL OR (v.record->'rates'->>'fav_fan_ratio')::float8 >= $15)
    AND ($16::bigint IS NULL OR (v.record->>'follower_count')::bigint <= $16)
"#;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_video_filter<'q>(query: PgQuery<'q>, filter: &VideoFilter) -> PgQuery<'q> {
    let tag = filter.tag.map(|tag| match tag {
        HotTag::BasicHot => "basic_hot",
        HotTag::LowFanHot => "low_fan_hot",
    });
    query
        .bind(filter.task_id)
        .bind(tag)
        .bind(filter.process_status.map(|s| s.as_str()))
        .bind(filter.publish_from)
        .bind(filter.publish_to)
        .bind(filter.fetch_from)
        .bind(filter.fetch_to)
        .bind(filter.min_views.map(saturating_i64))
        .bind(filter.min_fav.map(saturating_i64))
        .bind(filter.min_coin.map(saturating_i64))
        .bind(filter.min_reply.map(saturating_i64))
        .bind(filter.min_fav_rate)
        .bind(filter.min_coin_rate)
        .bind(filter.min_reply_rate)
        .bind(filter.min_fav_fan_ratio)
        .bind(filter.fan_max.map(saturating_i64))
}

fn sort_column(sort: VideoSort) -> &'static str {
    match sort {
        VideoSort::Views => "(v.record->'stats'->>'views')::bigint",
        VideoSort::Fav => "(v.record->'stats'->>'fav')::bigint",
        VideoSort::Coin => "(v.record->'stats'->>'coin')::bigint",
        VideoSort::Reply => "(v.record->'stats'->>'reply')::bigint",
        VideoSort::FavRate => "(v.record->'rates'->>'fav_rate')::float8",
        VideoSort::CoinRate => "(v.record->'rates'->>'coin_rate')::float8",
        VideoSort::ReplyRate => "(v.record->'rates'->>'reply_rate')::float8",
        VideoSort::FavFanRatio => "(v.record->'rates'->>'fav_fan_ratio')::float8",
        VideoSort::PublishTime => "(v.record->>'publish_time')::timestamptz",
        VideoSort::FetchTime => "v.fetch_time",
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn video_from_row(row: &PgRow) -> Result<VideoRecord, StoreError> {
    let mut record: VideoRecord = json_col(row, "record")?;
    record.source_task_ids = row.try_get::<Vec<Uuid>, _>("task_ids")?;
    Ok(record)
}

impl PgStore {
    async fn patch_video(
        &self,
        bvid: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<VideoRecord, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE videos v
               SET record = v.record || jsonb_build_object($2::text, $3::jsonb)
             WHERE v.bvid = $1
            RETURNING v.record,
                      COALESCE((SELECT array_agg(tv.task_id) FROM task_videos tv WHERE tv.bvid = v.bvid), '{}') AS task_ids
            "#,
        )
        .bind(bvid)
        .bind(field)
        .bind(Json(value))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("video", bvid))?;
        video_from_row(&row)
    }
}

#[async_trait]
impl AlertRepository for PgStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, task_id, kind, level, title, message, meta, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(alert.id)
        .bind(alert.task_id)
        .bind(alert.kind.as_str())
        .bind(alert.level.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(Json(&alert.meta))
        .bind(alert.created_at)
        .bind(alert.read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_alerts(
        &self,
        unread_only: bool,
        page: PageRequest,
    ) -> Result<Page<Alert>, StoreError> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM alerts WHERE (NOT $1 OR read_at IS NULL)",
        )
        .bind(unread_only)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ALERT_COLUMNS}
              FROM alerts
             WHERE (NOT $1 OR read_at IS NULL)
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3
            "#
        ))
        .bind(unread_only)
        .bind(page.page_size as i64)
        .bind(offset(page))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: rows.iter().map(alert_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            page_size: page.page_size,
            total: total.max(0) as u64,
        })
    }

    async fn mark_alert_read(&self, id: Uuid, now: DateTime<Utc>) -> Result<Alert, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE alerts
               SET read_at = COALESCE(read_at, $2)
             WHERE id = $1
            RETURNING {ALERT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("alert", id))?;
        alert_from_row(&row)
    }

    async fn mark_all_alerts_read(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE alerts SET read_at = $1 WHERE read_at IS NULL")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn unread_alert_count(&self) -> Result<u64, StoreError> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS total FROM alerts WHERE read_at IS NULL")
                .fetch_one(&self.pool)
                .await?
                .try_get("total")?;
        Ok(total.max(0) as u64)
    }
}

#[async_trait]
impl TemplateRepository for PgStore {
    async fn insert_template(&self, template: &Template) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, industry, strength, rules, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.industry)
        .bind(enum_text("strength", &template.strength)?)
        .bind(Json(&template.rules))
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_template(&self, template: &Template) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE templates
               SET name = $2,
                   industry = $3,
                   strength = $4,
                   rules = $5,
                   updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.industry)
        .bind(enum_text("strength", &template.strength)?)
        .bind(Json(&template.rules))
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("template", template.id));
        }
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, industry, strength, rules, created_at, updated_at
              FROM templates
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, industry, strength, rules, created_at, updated_at
              FROM templates
             ORDER BY created_at, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(template_from_row).collect()
    }

    async fn delete_template(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SettingsRepository for PgStore {
    async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let row = sqlx::query("SELECT data FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| json_col::<Settings>(r, "data")).transpose()
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (id, data, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE
               SET data = EXCLUDED.data,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Json(settings))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
