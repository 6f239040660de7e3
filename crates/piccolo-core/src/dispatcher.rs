//! The command dispatcher: a single thread owns every registered component,
//! polls each registered client's task queue in turn, and serializes all
//! component access through itself so no two commands ever execute
//! concurrently.
//!
//! Routing goes through the [`Component`] trait rather than reflection:
//! each registered component implements one `execute` entry point and
//! reports its own "unknown command" errors, which keeps routing
//! type-checked.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use serde_json::Value;

use crate::error::CoreError;
use crate::message::MessageBus;
use crate::scheduler::Scheduler;

/// Parses an ISO-8601 timestamp carried as a JSON string (`at_time` and
/// `end_time` kwargs are always ISO-8601 strings). Non-string values are
/// rejected.
fn parse_datetime(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// How often the dispatcher polls client queues when nothing is pending.
pub const POLL_DELAY: Duration = Duration::from_millis(100);

/// One request addressed to a component, or one of the control verbs
/// (`stop`, `components`, `suspendJob`, `unsuspendJob`, `getJob`) handled
/// by the dispatcher itself.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    /// `None` for the dispatcher's own control verbs.
    pub component: Option<String>,
    pub kwargs: HashMap<String, Value>,
}

impl Command {
    pub fn control(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            component: None,
            kwargs: HashMap::new(),
        }
    }

    pub fn new(component: impl Into<String>, name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            component: Some(component.into()),
            kwargs: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// A dispatcher reply: `('ok', value)` or `('nok', message)`.
#[derive(Debug, Clone)]
pub enum Response {
    Ok(Value),
    Nok(String),
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

/// Trait every dispatcher-registered component implements. `execute`
/// receives the bare command name (the "components"/"stop" control verbs
/// never reach here) and must report [`CoreError::UnknownCommand`] itself
/// for anything it doesn't support.
pub trait Component: Send {
    fn execute(&mut self, command: &str, kwargs: &HashMap<String, Value>) -> Result<Value, CoreError>;
    /// Called once, from the dispatcher thread, when the dispatcher is told
    /// to stop.
    fn stop(&mut self);
}

struct Client {
    tasks: Receiver<Command>,
    replies: Sender<Response>,
}

/// A handle a controller (CLI, HTTP adapter, scheduler caller) uses to talk
/// to a running [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    tasks: Sender<Command>,
    replies: Receiver<Response>,
}

impl DispatcherHandle {
    pub fn send(&self, cmd: Command) -> Response {
        if self.tasks.send(cmd).is_err() {
            return Response::Nok("dispatcher has stopped".into());
        }
        self.replies
            .recv()
            .unwrap_or_else(|_| Response::Nok("dispatcher has stopped".into()))
    }
}

/// Owns the component registry and the scheduler, and runs the single
/// dispatch loop.
pub struct Dispatcher {
    components: HashMap<String, Box<dyn Component>>,
    clients: Vec<Client>,
    scheduler: Scheduler,
    bus: Option<MessageBus>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            components: HashMap::new(),
            clients: Vec::new(),
            scheduler: Scheduler::new(),
            bus: None,
        }
    }

    pub fn set_message_bus(&mut self, bus: MessageBus) {
        self.bus = Some(bus);
    }

    pub fn register_component(&mut self, name: impl Into<String>, component: Box<dyn Component>) {
        self.components.insert(name.into(), component);
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Register a new client and return the handle the caller uses to talk
    /// to the dispatcher. Must be called before [`Dispatcher::run`].
    pub fn register_client(&mut self) -> DispatcherHandle {
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        self.clients.push(Client {
            tasks: task_rx,
            replies: reply_tx,
        });
        DispatcherHandle {
            tasks: task_tx,
            replies: reply_rx,
        }
    }

    /// A request whose kwargs carry any of `at_time`/`interval`/`end_time`
    /// is handed to the scheduler instead of being executed synchronously.
    /// The timing keys are stripped from the remaining kwargs before the
    /// payload is stored; an unparsable timing value is logged and rejected
    /// rather than raised.
    fn schedule(&mut self, component: &str, command: &str, mut kwargs: HashMap<String, Value>) -> Response {
        let at_time = kwargs.remove("at_time");
        let interval = kwargs.remove("interval");
        let end_time = kwargs.remove("end_time");

        let parsed_at = match at_time {
            Some(v) => match parse_datetime(&v) {
                Some(dt) => dt,
                None => {
                    warn!("rejecting scheduled '{command}': invalid at_time {v:?}");
                    return Response::Nok(format!("invalid at_time: {v:?}"));
                }
            },
            None => Utc::now(),
        };
        let parsed_interval = match interval {
            Some(v) => match v.as_f64() {
                Some(secs) => Some(chrono::Duration::milliseconds((secs * 1000.0) as i64)),
                None => {
                    warn!("rejecting scheduled '{command}': invalid interval {v:?}");
                    return Response::Nok(format!("invalid interval: {v:?}"));
                }
            },
            None => None,
        };
        let parsed_end = match end_time {
            Some(v) => match parse_datetime(&v) {
                Some(dt) => Some(dt),
                None => {
                    warn!("rejecting scheduled '{command}': invalid end_time {v:?}");
                    return Response::Nok(format!("invalid end_time: {v:?}"));
                }
            },
            None => None,
        };

        let payload = Command {
            name: command.to_string(),
            component: Some(component.to_string()),
            kwargs,
        };
        match self.scheduler.add(parsed_at, payload, parsed_interval, parsed_end) {
            Some(_jid) => Response::Ok(Value::String("scheduled".into())),
            None => Response::Nok("invalid schedule specification".into()),
        }
    }

    /// Shared shape for the `suspendJob`/`unsuspendJob` control verbs:
    /// pull a `jid` out of kwargs and apply `op` to the scheduler.
    fn with_jid(&mut self, kwargs: &HashMap<String, Value>, op: impl Fn(&mut Scheduler, u64) -> bool) -> Response {
        match kwargs.get("jid").and_then(Value::as_u64) {
            Some(jid) if op(&mut self.scheduler, jid) => Response::Ok(Value::Bool(true)),
            Some(jid) => Response::Nok(format!("no scheduled job with id {jid}")),
            None => Response::Nok("missing numeric argument 'jid'".into()),
        }
    }

    fn execute(&mut self, component: &str, command: &str, kwargs: &HashMap<String, Value>) -> Result<Value, CoreError> {
        let comp = self
            .components
            .get_mut(component)
            .ok_or_else(|| CoreError::UnknownComponent(component.to_string()))?;
        comp.execute(command, kwargs)
    }

    /// Run one full pass over every client's pending tasks plus the
    /// scheduler's due jobs, returning `true` if any work was done; the
    /// caller sleeps `POLL_DELAY` when this returns `false`.
    fn tick(&mut self) -> bool {
        let mut did_work = false;
        let mut stop_requested = false;

        for i in 0..self.clients.len() {
            let task = match self.clients[i].tasks.try_recv() {
                Ok(t) => t,
                Err(_) => continue,
            };
            did_work = true;

            let response = match (task.component.as_deref(), task.name.as_str()) {
                (None, "stop") => {
                    stop_requested = true;
                    Response::Ok(Value::String("stopping".into()))
                }
                (None, "components") => {
                    let names: Vec<Value> = self.component_names().into_iter().map(Value::String).collect();
                    Response::Ok(Value::Array(names))
                }
                (None, "suspendJob") => self.with_jid(&task.kwargs, |s, jid| s.suspend(jid)),
                (None, "unsuspendJob") => self.with_jid(&task.kwargs, |s, jid| s.unsuspend(jid)),
                (None, "getJob") => match task.kwargs.get("jid").and_then(Value::as_u64) {
                    Some(jid) => match self.scheduler.get_job(jid) {
                        Some(job) => Response::Ok(serde_json::json!({
                            "jid": job.jid(),
                            "at_time": job.at_time().to_rfc3339(),
                            "interval": job.interval().map(|d| d.num_milliseconds() as f64 / 1000.0),
                            "end_time": job.end_time().map(|t| t.to_rfc3339()),
                            "has_run": job.has_run(),
                            "suspended": job.suspended(),
                        })),
                        None => Response::Nok(format!("no scheduled job with id {jid}")),
                    },
                    None => Response::Nok("missing numeric argument 'jid'".into()),
                },
                (Some(component), command)
                    if task
                        .kwargs
                        .keys()
                        .any(|k| k == "at_time" || k == "interval" || k == "end_time") =>
                {
                    self.schedule(component, command, task.kwargs.clone())
                }
                (Some(component), command) => match self.execute(component, command, &task.kwargs) {
                    Ok(v) => Response::Ok(v),
                    Err(e) => {
                        if let Some(bus) = &self.bus {
                            bus.error(e.message());
                        }
                        Response::Nok(e.message())
                    }
                },
                (None, other) => Response::Nok(format!("unknown control verb '{other}'")),
            };

            let _ = self.clients[i].replies.send(response);
        }

        for job in self.scheduler.drain_runnable() {
            did_work = true;
            let result = match job.component {
                Some(component) => self.execute(&component, &job.name, &job.kwargs),
                None => Ok(Value::Null),
            };
            if let Err(e) = result {
                warn!("scheduled job '{}' failed: {}", job.name, e.message());
                if let Some(bus) = &self.bus {
                    bus.warning(format!("scheduled job '{}' failed: {}", job.name, e.message()));
                }
            }
        }

        if stop_requested {
            info!("dispatcher stopping: signalling all components");
            for comp in self.components.values_mut() {
                comp.stop();
            }
            for client in &self.clients {
                let _ = client.replies.send(Response::Ok(Value::String("stopped".into())));
            }
            did_work = false;
            self.clients.clear();
        }

        did_work
    }

    /// Drive the dispatch loop until a client sends `stop`. Intended to be
    /// run on its own thread via [`Dispatcher::spawn`]; exposed directly so
    /// tests can single-step it without a background thread.
    pub fn run_until_stopped(mut self) {
        loop {
            let did_work = self.tick();
            if self.clients.is_empty() {
                return;
            }
            if !did_work {
                thread::sleep(POLL_DELAY);
            }
        }
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("piccolo-dispatcher".into())
            .spawn(move || self.run_until_stopped())
            .expect("failed to spawn dispatcher thread")
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        stopped: bool,
    }

    impl Component for Echo {
        fn execute(&mut self, command: &str, kwargs: &HashMap<String, Value>) -> Result<Value, CoreError> {
            match command {
                "ping" => Ok(Value::String("pong".into())),
                "echo" => Ok(kwargs.get("value").cloned().unwrap_or(Value::Null)),
                "boom" => Err(CoreError::Other("boom".into())),
                other => Err(CoreError::UnknownCommand {
                    component: "echo".into(),
                    command: other.into(),
                }),
            }
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    #[test]
    fn routes_command_to_registered_component() {
        let mut d = Dispatcher::new();
        d.register_component("echo", Box::new(Echo { stopped: false }));
        let handle = d.register_client();
        let jh = std::thread::spawn(move || d.run_until_stopped());

        let resp = handle.send(Command::new("echo", "ping"));
        assert!(matches!(resp, Response::Ok(Value::String(s)) if s == "pong"));

        handle.send(Command::control("stop"));
        jh.join().unwrap();
    }

    #[test]
    fn unknown_component_is_nok_not_a_panic() {
        let mut d = Dispatcher::new();
        let handle = d.register_client();
        let jh = std::thread::spawn(move || d.run_until_stopped());

        let resp = handle.send(Command::new("nope", "ping"));
        assert!(matches!(resp, Response::Nok(_)));

        handle.send(Command::control("stop"));
        jh.join().unwrap();
    }

    #[test]
    fn kwargs_with_timing_keys_are_scheduled_not_executed() {
        let mut d = Dispatcher::new();
        d.register_component("echo", Box::new(Echo { stopped: false }));
        let handle = d.register_client();
        let jh = std::thread::spawn(move || d.run_until_stopped());

        let at = (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
        let resp = handle.send(Command::new("echo", "ping").with_arg("at_time", at));
        assert!(matches!(resp, Response::Ok(Value::String(s)) if s == "scheduled"));

        handle.send(Command::control("stop"));
        jh.join().unwrap();
    }

    #[test]
    fn components_lists_registered_names() {
        let mut d = Dispatcher::new();
        d.register_component("echo", Box::new(Echo { stopped: false }));
        let handle = d.register_client();
        let jh = std::thread::spawn(move || d.run_until_stopped());

        let resp = handle.send(Command::control("components"));
        match resp {
            Response::Ok(Value::Array(names)) => {
                assert_eq!(names, vec![Value::String("echo".into())]);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        handle.send(Command::control("stop"));
        jh.join().unwrap();
    }

    #[test]
    fn suspend_and_unsuspend_job_by_id() {
        let mut d = Dispatcher::new();
        let jid = d.scheduler.add(
            Utc::now() + chrono::Duration::seconds(60),
            Command::new("echo", "ping"),
            None,
            None,
        );
        assert!(jid.is_some());
        let handle = d.register_client();
        let jh = std::thread::spawn(move || d.run_until_stopped());

        let resp = handle.send(Command::control("suspendJob").with_arg("jid", 0i64));
        assert!(matches!(resp, Response::Ok(Value::Bool(true))));

        let resp = handle.send(Command::control("getJob").with_arg("jid", 0i64));
        match resp {
            Response::Ok(v) => assert_eq!(v["suspended"], Value::Bool(true)),
            other => panic!("unexpected response: {other:?}"),
        }

        let resp = handle.send(Command::control("unsuspendJob").with_arg("jid", 0i64));
        assert!(matches!(resp, Response::Ok(Value::Bool(true))));

        let resp = handle.send(Command::control("suspendJob").with_arg("jid", 999i64));
        assert!(matches!(resp, Response::Nok(_)));

        handle.send(Command::control("stop"));
        jh.join().unwrap();
    }

    #[test]
    fn get_job_on_unknown_id_is_nok() {
        let mut d = Dispatcher::new();
        let handle = d.register_client();
        let jh = std::thread::spawn(move || d.run_until_stopped());

        let resp = handle.send(Command::control("getJob").with_arg("jid", 42i64));
        assert!(matches!(resp, Response::Nok(_)));

        handle.send(Command::control("stop"));
        jh.join().unwrap();
    }
}
