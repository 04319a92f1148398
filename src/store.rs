use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinError};

use crate::models::{ErrorDetail, Task, TaskMutation, TransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task `{0}` not found")]
    NotFound(String),
    #[error("task `{0}` already exists")]
    Duplicate(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored task `{id}` is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("store worker failed: {0}")]
    Join(#[from] JoinError),
    #[error("store connection lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn apply(&self, task_id: &str, mutation: TaskMutation) -> Result<bool, StoreError>;

    async fn unfinished(&self) -> Result<Vec<Task>, StoreError>;
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn apply(&self, task_id: &str, mutation: TaskMutation) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        Ok(task.apply(mutation)?)
    }

    async fn unfinished(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| !task.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }
}

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        source_url TEXT NOT NULL,
        resolution_request TEXT NOT NULL,
        include_audio INTEGER NOT NULL,
        status TEXT NOT NULL,
        stage TEXT NOT NULL,
        progress REAL NOT NULL,
        created_at TEXT NOT NULL,
        result_reference TEXT,
        result_size INTEGER,
        error_category TEXT,
        error_message TEXT
    );
";

const TASK_COLUMNS: &str = "id,source_url,resolution_request,include_audio,status,stage,progress,created_at,result_reference,result_size,error_category,error_message";

struct TaskRow {
    id: String,
    source_url: String,
    resolution_request: String,
    include_audio: bool,
    status: String,
    stage: String,
    progress: f64,
    created_at: String,
    result_reference: Option<String>,
    result_size: Option<i64>,
    error_category: Option<String>,
    error_message: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        let id = self.id;
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|err| corrupt(format!("created_at: {err}")))?
            .with_timezone(&Utc);
        let error_detail = match (self.error_category, self.error_message) {
            (Some(category), Some(message)) => Some(ErrorDetail {
                category: category.parse().map_err(|err| corrupt(format!("{err}")))?,
                message,
            }),
            (None, None) => None,
            _ => return Err(corrupt("partial error detail".to_string())),
        };
        let result_size = self
            .result_size
            .map(u64::try_from)
            .transpose()
            .map_err(|_| corrupt("negative result_size".to_string()))?;
        let resolution_request = self
            .resolution_request
            .parse()
            .map_err(|err| corrupt(format!("{err}")))?;
        let status = self.status.parse().map_err(|err| corrupt(format!("{err}")))?;
        let stage = self.stage.parse().map_err(|err| corrupt(format!("{err}")))?;

        Ok(Task {
            id,
            resolution_request,
            status,
            stage,
            source_url: self.source_url,
            include_audio: self.include_audio,
            progress: self.progress,
            created_at,
            result_reference: self.result_reference,
            result_size,
            error_detail,
        })
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        source_url: row.get(1)?,
        resolution_request: row.get(2)?,
        include_audio: row.get(3)?,
        status: row.get(4)?,
        stage: row.get(5)?,
        progress: row.get(6)?,
        created_at: row.get(7)?,
        result_reference: row.get(8)?,
        result_size: row.get(9)?,
        error_category: row.get(10)?,
        error_message: row.get(11)?,
    })
}

fn load_task(conn: &Connection, task_id: &str) -> Result<Option<Task>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            read_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

fn save_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tasks SET status=?2, stage=?3, progress=?4, result_reference=?5, result_size=?6, error_category=?7, error_message=?8 WHERE id=?1",
        params![
            task.id,
            task.status.as_str(),
            task.stage.as_str(),
            task.progress,
            task.result_reference,
            task.result_size.map(|size| size as i64),
            task.error_detail.as_ref().map(|detail| detail.category.as_str()),
            task.error_detail.as_ref().map(|detail| detail.message.as_str()),
        ],
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening task database {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("Failed initialising task database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO tasks (id,source_url,resolution_request,include_audio,status,stage,progress,created_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    task.id,
                    task.source_url,
                    task.resolution_request.to_string(),
                    task.include_audio,
                    task.status.as_str(),
                    task.stage.as_str(),
                    task.progress,
                    task.created_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate(task.id));
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| load_task(conn, &task_id)).await
    }

    async fn apply(&self, task_id: &str, mutation: TaskMutation) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut task =
                load_task(&tx, &task_id)?.ok_or_else(|| StoreError::NotFound(task_id.clone()))?;
            let changed = task.apply(mutation)?;
            if changed {
                save_task(&tx, &task)?;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    async fn unfinished(&self) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ('pending', 'in_progress') ORDER BY created_at"
            ))?;
            let rows = statement
                .query_map([], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }
}
