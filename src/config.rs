//! Configuration management for forkq.
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

use crate::{
    error::{ConfigError, StoreError},
    recurring::RecurringTask,
    runtime,
    store::{FileStore, Store},
};

/// File name looked up in the working directory and the config directories.
pub const CONFIG_FILE_NAME: &str = "forkq.yaml";

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store directory. Relative paths resolve against the config file.
    pub store: Option<String>,
    /// Optional `.env` file loaded before `${VAR}` expansion.
    pub env_file: Option<String>,
    pub supervisor: SupervisorConfig,
    /// How often every process refreshes its registration.
    #[serde(deserialize_with = "deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// Registrations older than this are considered dead and pruned.
    #[serde(deserialize_with = "deserialize_duration")]
    pub process_alive_threshold: Duration,
    /// Worker groups. Absent means one worker on every queue.
    pub workers: Option<Vec<WorkerConfig>>,
    /// Absent means one dispatcher with default settings.
    pub dispatchers: Option<Vec<DispatcherConfig>>,
    /// Absent means an enabled scheduler.
    pub scheduler: Option<SchedulerConfig>,
    /// Recurring tasks keyed by name.
    pub recurring: BTreeMap<String, RecurringTaskConfig>,
    pub hooks: HooksConfig,
    /// Directory of the loaded config file.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: None,
            env_file: None,
            supervisor: SupervisorConfig::default(),
            heartbeat_interval: Duration::from_secs(60),
            process_alive_threshold: Duration::from_secs(5 * 60),
            workers: None,
            dispatchers: None,
            scheduler: None,
            recurring: BTreeMap::new(),
            hooks: HooksConfig::default(),
            project_dir: None,
        }
    }
}

/// Settings of the supervisor's own loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between child reaping passes.
    #[serde(deserialize_with = "deserialize_duration")]
    pub polling_interval: Duration,
    /// Time children get to exit after SIGTERM before SIGKILL. Unset waits forever.
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub shutdown_timeout: Option<Duration>,
    /// Replace children that exit while the supervisor is running.
    pub restart_children: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            shutdown_timeout: None,
            restart_children: true,
        }
    }
}

/// One worker group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue selectors in claim order. Accepts a list or a comma separated string.
    #[serde(deserialize_with = "deserialize_queues")]
    pub queues: Vec<String>,
    /// Number of worker processes forked for this group.
    pub processes: usize,
    /// Jobs executed concurrently by each worker.
    pub threads: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub polling_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["*".to_string()],
            processes: 1,
            threads: 3,
            polling_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of due jobs released per poll.
    pub batch_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub polling_interval: Duration,
    /// Queue selectors whose scheduled jobs this dispatcher releases.
    #[serde(deserialize_with = "deserialize_queues")]
    pub queues: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            polling_interval: Duration::from_secs(1),
            queues: vec!["*".to_string()],
        }
    }
}

impl DispatcherConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// `false` removes the scheduler from the topology.
    pub enabled: bool,
    /// Run the scheduler without evaluating recurring tasks.
    pub skip_recurring: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub polling_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_recurring: false,
            polling_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn skip_recurring(mut self, skip: bool) -> Self {
        self.skip_recurring = skip;
        self
    }
}

/// A recurring task as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct RecurringTaskConfig {
    /// Six field cron expression (seconds first).
    pub schedule: String,
    pub command: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    /// IANA timezone the schedule is evaluated in. Defaults to UTC.
    pub timezone: Option<String>,
}

fn default_queue() -> String {
    "default".to_string()
}

/// Shell commands run at each lifecycle phase of one process kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseHooks {
    pub on_start: Option<String>,
    pub on_stop: Option<String>,
    pub on_exit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub supervisor: PhaseHooks,
    pub worker: PhaseHooks,
    pub dispatcher: PhaseHooks,
    pub scheduler: PhaseHooks,
    /// Command replacing the error sink. Receives `FORKQ_ERROR`.
    pub on_thread_error: Option<String>,
}

/// The set of processes a supervisor forks.
#[derive(Debug, Clone)]
pub struct Topology {
    pub workers: Vec<WorkerConfig>,
    pub dispatchers: Vec<DispatcherConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub recurring: Vec<RecurringTask>,
}

impl Default for Topology {
    /// One worker on every queue, one dispatcher and a scheduler.
    fn default() -> Self {
        Self {
            workers: vec![WorkerConfig::default()],
            dispatchers: vec![DispatcherConfig::default()],
            scheduler: Some(SchedulerConfig::default()),
            recurring: Vec::new(),
        }
    }
}

impl Topology {
    /// A topology without any process.
    pub fn empty() -> Self {
        Self {
            workers: Vec::new(),
            dispatchers: Vec::new(),
            scheduler: None,
            recurring: Vec::new(),
        }
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn recurring(mut self, task: RecurringTask) -> Self {
        self.recurring.push(task);
        self
    }

    /// Number of children a supervisor forks for this topology.
    pub fn process_count(&self) -> usize {
        self.workers.iter().map(|w| w.processes).sum::<usize>()
            + self.dispatchers.len()
            + usize::from(self.scheduler.is_some())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, worker) in self.workers.iter().enumerate() {
            if worker.queues.is_empty() || worker.queues.iter().any(|q| q.is_empty()) {
                return Err(invalid(format!("worker {index} has an empty queue list")));
            }
            if worker.threads == 0 {
                return Err(invalid(format!("worker {index} must have at least one thread")));
            }
            if worker.processes == 0 {
                return Err(invalid(format!(
                    "worker {index} must have at least one process"
                )));
            }
            if worker.polling_interval.is_zero() {
                return Err(invalid(format!("worker {index} polling_interval must be > 0")));
            }
        }
        for (index, dispatcher) in self.dispatchers.iter().enumerate() {
            if dispatcher.batch_size == 0 {
                return Err(invalid(format!("dispatcher {index} batch_size must be > 0")));
            }
            if dispatcher.queues.is_empty() {
                return Err(invalid(format!("dispatcher {index} has an empty queue list")));
            }
            if dispatcher.polling_interval.is_zero() {
                return Err(invalid(format!(
                    "dispatcher {index} polling_interval must be > 0"
                )));
            }
        }
        if let Some(scheduler) = &self.scheduler
            && scheduler.polling_interval.is_zero()
        {
            return Err(invalid("scheduler polling_interval must be > 0"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl Config {
    /// Resolves the process topology described by this config.
    pub fn topology(&self) -> Result<Topology, ConfigError> {
        let scheduler = match &self.scheduler {
            None => Some(SchedulerConfig::default()),
            Some(scheduler) if scheduler.enabled => Some(scheduler.clone()),
            Some(_) => None,
        };
        let recurring = self
            .recurring
            .iter()
            .map(|(key, task)| RecurringTask::from_config(key, task))
            .collect::<Result<Vec<_>, _>>()?;

        let topology = Topology {
            workers: self
                .workers
                .clone()
                .unwrap_or_else(|| vec![WorkerConfig::default()]),
            dispatchers: self
                .dispatchers
                .clone()
                .unwrap_or_else(|| vec![DispatcherConfig::default()]),
            scheduler,
            recurring,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Directory holding the store files.
    pub fn store_dir(&self) -> PathBuf {
        match &self.store {
            Some(dir) => {
                let path = Path::new(dir);
                match &self.project_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.to_path_buf(),
                }
            }
            None => runtime::state_dir(),
        }
    }

    pub fn open_store(&self) -> Result<Arc<dyn Store>, StoreError> {
        Ok(Arc::new(FileStore::open(self.store_dir())?))
    }
}

/// Parses `<n>ms`, `<n>s`, `<n>m`, `<n>h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(invalid("Duration value cannot be empty"));
    }

    let (amount_str, millis) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .trim()
        .parse()
        .map_err(|_| invalid(format!("Invalid duration value: '{raw}'")))?;
    Ok(Duration::from_millis(amount.saturating_mul(millis)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn resolve(self) -> Result<Duration, ConfigError> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .resolve()
        .map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(deserializer)?
        .map(RawDuration::resolve)
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueueList {
    Joined(String),
    List(Vec<String>),
}

fn deserialize_queues<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let queues = match QueueList::deserialize(deserializer)? {
        QueueList::Joined(joined) => joined.split(',').map(|q| q.trim().to_string()).collect(),
        QueueList::List(list) => list.into_iter().map(|q| q.trim().to_string()).collect(),
    };
    Ok(queues)
}

/// Expands `${VAR}` references. Bare `$VAR` is left for the shell.
pub fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| invalid(format!("Invalid expansion pattern: {e}")))?;
    let mut missing: Option<String> = None;
    let expanded = re.replace_all(input, |caps: &Captures| match env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => {
            missing.get_or_insert_with(|| caps[1].to_string());
            String::new()
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}

/// Loads a `.env` file into the process environment.
fn load_env_file(path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();

            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            unsafe {
                env::set_var(key, value);
            }
        }
    }
    Ok(())
}

#[derive(Deserialize, Default)]
struct EnvFileOnly {
    env_file: Option<String>,
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    runtime::config_dirs()
        .into_iter()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|path| path.exists())
}

/// Loads the configuration, expanding `${VAR}` references.
///
/// Without an explicit path the working directory and then the runtime config
/// directories are searched. When nothing is found the defaults apply.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => match find_config_file() {
            Some(path) => path,
            None => {
                debug!("No {CONFIG_FILE_NAME} found, using the default topology");
                return Ok(Config {
                    project_dir: env::current_dir().ok(),
                    ..Config::default()
                });
            }
        },
    };

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let env_only: Option<EnvFileOnly> = serde_yaml::from_str(&content)?;
    if let Some(env_file) = env_only.and_then(|cfg| cfg.env_file) {
        let path = Path::new(&env_file);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_path.join(path)
        };
        load_env_file(&resolved)?;
    }

    let expanded = expand_env_vars(&content)?;
    let mut config: Config = if expanded.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&expanded)?
    };
    config.project_dir = Some(base_path);
    debug!("Loaded config from {}", config_path.display());
    Ok(config)
}
