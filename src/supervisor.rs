use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::FatalError;

pub(crate) type StartFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub(crate) type StartFn = Arc<dyn Fn(CancellationToken) -> StartFuture + Send + Sync>;

/// A respawnable child: stage task or nested supervisor. `start` is
/// called once per (re)spawn with that incarnation's stop token.
#[derive(Clone)]
pub(crate) struct ChildSpec {
    pub(crate) name: String,
    pub(crate) start: StartFn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Restart only the failed child.
    OneForOne,
    /// Stop and restart every child.
    OneForAll,
    /// Restart the failed child and every sibling declared after it.
    RestForOne,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RestartIntensity {
    pub max_restarts: usize,
    pub window: Duration,
}

pub(crate) const DEFAULT_MAX_RESTARTS: usize = 16;
pub(crate) const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(5);

impl Default for RestartIntensity {
    fn default() -> Self {
        RestartIntensity {
            max_restarts: DEFAULT_MAX_RESTARTS,
            window: DEFAULT_RESTART_WINDOW,
        }
    }
}

struct Child {
    spec: ChildSpec,
    stop: Option<CancellationToken>,
    task: Option<Id>,
}

/// Watches its children and applies the restart strategy when one dies
/// while the topology is running. A child that keeps a pool of
/// restarts above the intensity limit melts the supervisor down: it
/// stops everything below it and exits abnormally, which its own
/// parent treats as a crash in turn.
pub(crate) struct Supervisor {
    name: String,
    strategy: Strategy,
    children: Vec<Child>,
    cancel: CancellationToken,
    intensity: RestartIntensity,
    restarts: VecDeque<Instant>,
}

impl Supervisor {
    pub(crate) fn new(
        name: String,
        strategy: Strategy,
        specs: Vec<ChildSpec>,
        cancel: CancellationToken,
        intensity: RestartIntensity,
    ) -> Self {
        Supervisor {
            name,
            strategy,
            children: specs
                .into_iter()
                .map(|spec| Child { spec, stop: None, task: None })
                .collect(),
            cancel,
            intensity,
            restarts: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), FatalError> {
        let mut set: JoinSet<()> = JoinSet::new();
        let mut index: HashMap<Id, usize> = HashMap::new();
        let mut stopping: HashSet<Id> = HashSet::new();

        for i in 0..self.children.len() {
            self.start_child(i, &mut set, &mut index);
        }

        let fatal: Option<FatalError> = 'run: loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'run None,
                joined = set.join_next_with_id(), if !set.is_empty() => {
                    let Some(joined) = joined else { continue };
                    let (id, panicked) = match joined {
                        Ok((id, ())) => (id, false),
                        Err(join_error) => (join_error.id(), join_error.is_panic()),
                    };
                    let Some(crashed) = index.remove(&id) else { continue };
                    if stopping.remove(&id) {
                        continue;
                    }
                    self.children[crashed].stop = None;
                    self.children[crashed].task = None;
                    warn!(
                        supervisor = %self.name,
                        child = %self.children[crashed].spec.name,
                        panicked,
                        "child exited; applying restart strategy"
                    );
                    if let Err(fatal) = self.note_restart() {
                        break 'run Some(fatal);
                    }

                    let restart: Vec<usize> = match self.strategy {
                        Strategy::OneForOne => vec![crashed],
                        Strategy::OneForAll => (0..self.children.len()).collect(),
                        Strategy::RestForOne => (crashed..self.children.len()).collect(),
                    };

                    // stop the still-running members of the restart
                    // set; they finish their current event and exit
                    for &j in &restart {
                        if let Some(stop) = self.children[j].stop.take() {
                            stop.cancel();
                        }
                        if let Some(task) = self.children[j].task.take() {
                            stopping.insert(task);
                        }
                    }

                    // extra crashes during the wind-down ride along
                    let mut extra: Vec<usize> = Vec::new();
                    while !stopping.is_empty() {
                        let Some(joined) = set.join_next_with_id().await else {
                            break;
                        };
                        let id = match joined {
                            Ok((id, ())) => id,
                            Err(join_error) => join_error.id(),
                        };
                        let removed = index.remove(&id);
                        if stopping.remove(&id) {
                            continue;
                        }
                        let Some(j) = removed else { continue };
                        self.children[j].stop = None;
                        self.children[j].task = None;
                        if let Err(fatal) = self.note_restart() {
                            break 'run Some(fatal);
                        }
                        if !restart.contains(&j) {
                            extra.push(j);
                        }
                    }

                    for &j in restart.iter().chain(extra.iter()) {
                        self.start_child(j, &mut set, &mut index);
                    }
                }
            }
        };

        // stop whatever is still running, meltdown or shutdown alike
        self.cancel.cancel();
        while set.join_next().await.is_some() {}

        match fatal {
            Some(fatal) => {
                error!(supervisor = %self.name, %fatal, "supervisor giving up");
                Err(fatal)
            }
            None => {
                debug!(supervisor = %self.name, "shut down");
                Ok(())
            }
        }
    }

    fn start_child(
        &mut self,
        i: usize,
        set: &mut JoinSet<()>,
        index: &mut HashMap<Id, usize>,
    ) {
        let stop = self.cancel.child_token();
        let future = (self.children[i].spec.start)(stop.clone());
        let handle = set.spawn(future);
        index.insert(handle.id(), i);
        self.children[i].stop = Some(stop);
        self.children[i].task = Some(handle.id());
    }

    fn note_restart(&mut self) -> Result<(), FatalError> {
        let now = Instant::now();
        self.restarts.push_back(now);
        while self
            .restarts
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.intensity.window)
        {
            self.restarts.pop_front();
        }
        if self.restarts.len() > self.intensity.max_restarts {
            Err(FatalError::Meltdown {
                supervisor: self.name.clone(),
                restarts: self.restarts.len(),
                window: self.intensity.window,
            })
        } else {
            Ok(())
        }
    }
}

/// Wrap a supervisor as a child of another supervisor.
pub(crate) fn spec(
    name: String,
    strategy: Strategy,
    children: Vec<ChildSpec>,
    intensity: RestartIntensity,
) -> ChildSpec {
    ChildSpec {
        name: name.clone(),
        start: Arc::new(move |stop: CancellationToken| {
            let supervisor =
                Supervisor::new(name.clone(), strategy, children.clone(), stop, intensity);
            Box::pin(async move {
                let _ = supervisor.run().await;
            })
        }),
    }
}
