//! Built-in demo scenarios, runnable from the `simnet` binary.

use std::time::Duration;

use bytes::Bytes;

use crate::{
    config::SimConfig,
    env::Env,
    harness::{SimReport, Simulation},
    simulation::NetworkProfile,
    transport::{Endpoint, SimError},
};

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub run: fn(SimConfig) -> SimReport,
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "request-reply",
        description: "local sends Hello to server:80 and reads World back",
        run: request_reply,
    },
    Scenario {
        name: "reorder",
        description: "two writes cross a link that reverses packet latency",
        run: reorder,
    },
    Scenario {
        name: "refused",
        description: "a full accept backlog answers the second client with RESET",
        run: refused,
    },
    Scenario {
        name: "no-route",
        description: "connecting to a machine without a link times out unreachable",
        run: no_route,
    },
    Scenario {
        name: "subscribe",
        description: "a publisher streams events until it closes the connection",
        run: subscribe,
    },
];

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn report_error(env: &Env, result: Result<(), SimError>) {
    if let Err(err) = result {
        env.debug(format!("error: {err}"));
    }
}

fn text(payload: &Bytes) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

pub fn request_reply(config: SimConfig) -> SimReport {
    async fn server(env: Env) -> Result<(), SimError> {
        let socket = env.bind(80)?;
        let conn = socket.accept().await?;
        let request = conn.recv().await?;
        env.debug(format!("Got {}", text(&request)));
        conn.write("World")?;
        Ok(())
    }

    async fn client(env: Env) -> Result<(), SimError> {
        let conn = env.connect(("server", 80)).await?;
        conn.write("Hello")?;
        let reply = conn.read(Duration::from_secs(5)).await?;
        env.debug(format!("Got {}", text(&reply)));
        Ok(())
    }

    let mut sim = Simulation::new(config);
    sim.link("local", "server", NetworkProfile::default())
        .add_script("server", |env| async move {
            let result = server(env.clone()).await;
            report_error(&env, result);
        })
        .add_script("local", |env| async move {
            let result = client(env.clone()).await;
            report_error(&env, result);
        });
    sim.run()
}

pub fn reorder(config: SimConfig) -> SimReport {
    async fn server(env: Env) -> Result<(), SimError> {
        let socket = env.bind(80)?;
        let conn = socket.accept().await?;
        for _ in 0..2 {
            let payload = conn.recv().await?;
            env.debug(format!("Got {}", text(&payload)));
        }
        Ok(())
    }

    async fn client(env: Env) -> Result<(), SimError> {
        let conn = env.connect(("server", 80)).await?;
        conn.write("A")?;
        conn.write("B")?;
        // keep the connection open until the server has read both
        env.delay(Duration::from_secs(1)).await?;
        Ok(())
    }

    let mut sim = Simulation::new(config);
    let profile = NetworkProfile::builder()
        .reverse_latency(Duration::from_millis(100), Duration::from_millis(10), 10)
        .log_packets(true)
        .build();
    sim.link("local", "server", profile)
        .add_script("server", |env| async move {
            let result = server(env.clone()).await;
            report_error(&env, result);
        })
        .add_script("local", |env| async move {
            let result = client(env.clone()).await;
            report_error(&env, result);
        });
    sim.run()
}

pub fn refused(config: SimConfig) -> SimReport {
    async fn client(env: Env, start: Duration) -> Result<(), SimError> {
        env.delay(start).await?;
        let conn = env.connect(("server", 80)).await?;
        env.debug(format!("connected from {}", conn.local()));
        env.delay(Duration::from_secs(1)).await?;
        Ok(())
    }

    let mut sim = Simulation::new(config);
    sim.link("first", "server", NetworkProfile::default())
        .link("second", "server", NetworkProfile::default())
        .add_script("server", |env| async move {
            // bound but never accepting
            match env.bind_with_backlog(80, 1) {
                Ok(_socket) => {
                    let _ = env.delay(Duration::from_secs(2)).await;
                }
                Err(err) => report_error(&env, Err(err)),
            }
        })
        .add_script("first", |env| async move {
            let result = client(env.clone(), Duration::ZERO).await;
            report_error(&env, result);
        })
        .add_script("second", |env| async move {
            let result = client(env.clone(), Duration::from_millis(100)).await;
            report_error(&env, result);
        });
    sim.run()
}

pub fn no_route(config: SimConfig) -> SimReport {
    let mut sim = Simulation::new(config);
    sim.add_machine("island").add_script("local", |env| async move {
        let remote = Endpoint::new("island", 80);
        let result = env
            .connect_timeout(remote, Duration::from_secs(3))
            .await
            .map(drop);
        report_error(&env, result);
    });
    sim.run()
}

pub fn subscribe(config: SimConfig) -> SimReport {
    const EVENTS: usize = 5;

    async fn publisher(env: Env) -> Result<(), SimError> {
        let socket = env.bind(7000)?;
        let conn = socket.accept().await?;
        for n in 0..EVENTS {
            conn.write(format!("event-{n}"))?;
            env.delay(Duration::from_millis(50)).await?;
        }
        env.debug("closing stream");
        Ok(())
    }

    async fn subscriber(env: Env) -> Result<(), SimError> {
        let conn = env.connect(("publisher", 7000)).await?;
        let mut received = 0;
        loop {
            match conn.recv().await {
                Ok(event) => {
                    received += 1;
                    env.debug(format!("Got {}", text(&event)));
                }
                Err(err) if err.is_reset() => {
                    env.debug(format!("stream ended after {received} events"));
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    let mut sim = Simulation::new(config);
    let profile = NetworkProfile::builder()
        .latency_range(Duration::from_millis(5)..Duration::from_millis(40))
        .build();
    sim.link("publisher", "subscriber", profile)
        .add_script("publisher", |env| async move {
            let result = publisher(env.clone()).await;
            report_error(&env, result);
        })
        .add_script("subscriber", |env| async move {
            let result = subscriber(env.clone()).await;
            report_error(&env, result);
        });
    sim.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ExitReason;

    #[test_log::test]
    fn test_request_reply_scenario() {
        let report = request_reply(SimConfig::default());
        assert_eq!(report.exit, ExitReason::AllHalted);
        assert_eq!(report.messages_from("server:main"), vec!["started", "Got Hello", "finished"]);
        assert!(report.messages_from("local:main").contains(&"Got World"));
    }

    #[test_log::test]
    fn test_reorder_scenario_reads_in_order() {
        let report = reorder(SimConfig::default());
        let got: Vec<_> = report
            .messages_from("server:main")
            .into_iter()
            .filter(|m| m.starts_with("Got"))
            .collect();
        assert_eq!(got, vec!["Got A", "Got B"]);
    }

    #[test]
    fn test_refused_scenario() {
        let report = refused(SimConfig::default());
        assert!(report
            .messages_from("first:main")
            .iter()
            .any(|m| m.starts_with("connected from first:")));
        assert!(report
            .messages_from("second:main")
            .contains(&"error: connection reset by server:80"));
    }

    #[test]
    fn test_no_route_scenario() {
        let report = no_route(SimConfig::default());
        assert!(report.logged("error: no route to host island:80"));
        assert_eq!(report.finished_at, Duration::from_secs(3));
        assert_eq!(report.network.dropped_no_route, 1);
    }

    #[test]
    fn test_subscribe_scenario() {
        let report = subscribe(SimConfig::default());
        let messages = report.messages_from("subscriber:main");
        assert_eq!(messages.iter().filter(|m| m.starts_with("Got event-")).count(), 5);
        assert!(messages.contains(&"stream ended after 5 events"));
    }

    #[test]
    fn test_every_scenario_is_listed() {
        for name in ["request-reply", "reorder", "refused", "no-route", "subscribe"] {
            assert!(find(name).is_some(), "{name}");
        }
        assert!(find("nope").is_none());
    }
}
