//! End-to-end transport behavior over the simulated network.
//!
//! Scripts report what they observed through `Env::debug`; assertions run on
//! the event log of the finished run.

use std::time::Duration;

use simnet::{
    Env, ExitReason, Flag, NetworkProfile, SimConfig, SimError, SimReport, Simulation,
};

fn text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// Wraps a fallible script so its error ends up in the event log.
async fn logged<F>(env: Env, script: impl FnOnce(Env) -> F)
where
    F: std::future::Future<Output = Result<(), SimError>>,
{
    if let Err(err) = script(env.clone()).await {
        env.debug(format!("error: {err}"));
    }
}

fn two_machines(profile: NetworkProfile) -> Simulation {
    let mut sim = Simulation::new(SimConfig::default());
    sim.link("local", "server", profile);
    sim
}

// =============================================================================
// Request / reply
// =============================================================================

#[test_log::test]
fn test_hello_world() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let conn = socket.accept().await?;
            let request = conn.read(Duration::from_secs(5)).await?;
            env.debug(format!("request {}", text(&request)));
            conn.write("World")?;
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            conn.write("Hello")?;
            let reply = conn.read(Duration::from_secs(5)).await?;
            env.debug(format!("reply {}", text(&reply)));
            Ok(())
        })
    });

    let report = sim.run();
    assert_eq!(report.exit, ExitReason::AllHalted);
    assert!(report.finished_at < SimConfig::default().max_time);
    assert!(report.messages_from("server:main").contains(&"request Hello"));
    assert!(report.messages_from("local:main").contains(&"reply World"));
}

#[test]
fn test_request_reply_through_proxy() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.link("client", "proxy", NetworkProfile::default())
        .link("proxy", "backend", NetworkProfile::default());

    sim.add_script("backend", |env| {
        logged(env, |env| async move {
            let socket = env.bind(8080)?;
            let conn = socket.accept().await?;
            let request = conn.recv().await?;
            conn.write(format!("{} handled", text(&request)))?;
            env.debug(format!("served {}", conn.remote().machine()));
            Ok(())
        })
    });
    sim.add_script("proxy", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let downstream = socket.accept().await?;
            let request = downstream.recv().await?;
            let upstream = env.connect(("backend", 8080)).await?;
            upstream.write(request)?;
            let reply = upstream.recv().await?;
            downstream.write(reply)?;
            Ok(())
        })
    });
    sim.add_script("client", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("proxy", 80)).await?;
            conn.write("GET /")?;
            let reply = conn.read(Duration::from_secs(5)).await?;
            env.debug(format!("reply {}", text(&reply)));
            Ok(())
        })
    });

    let report = sim.run();
    assert!(report.messages_from("client:main").contains(&"reply GET / handled"));
    // the backend only ever talks to the proxy
    assert!(report.messages_from("backend:main").contains(&"served proxy"));
    assert_eq!(report.network.total_dropped(), 0);
}

// =============================================================================
// Ordering
// =============================================================================

#[test_log::test]
fn test_reversed_latency_keeps_write_order() {
    let mut sim = two_machines(NetworkProfile::reversing());
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let conn = socket.accept().await?;
            for _ in 0..2 {
                let payload = conn.read(Duration::from_secs(5)).await?;
                env.debug(format!("read {}", text(&payload)));
            }
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            conn.write("A")?;
            conn.write("B")?;
            env.delay(Duration::from_secs(1)).await?;
            Ok(())
        })
    });

    let report = sim.run();
    let reads: Vec<_> = report
        .messages_from("server:main")
        .into_iter()
        .filter(|m| m.starts_with("read"))
        .collect();
    assert_eq!(reads, vec!["read A", "read B"]);
}

#[test]
fn test_many_writes_arrive_in_order_under_jitter() {
    let profile = NetworkProfile::builder()
        .latency_range(Duration::from_millis(1)..Duration::from_millis(200))
        .build();
    let mut sim = two_machines(profile);
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let conn = socket.accept().await?;
            let mut got = Vec::new();
            for _ in 0..20 {
                got.push(text(&conn.recv().await?));
            }
            env.debug(got.join(","));
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            for n in 0..20 {
                conn.write(n.to_string())?;
            }
            env.delay(Duration::from_secs(2)).await?;
            Ok(())
        })
    });

    let report = sim.run();
    let expected = (0..20).map(|n| n.to_string()).collect::<Vec<_>>().join(",");
    assert!(report.messages_from("server:main").contains(&expected.as_str()));
}

#[test]
fn test_duplicated_packets_are_read_once() {
    let profile = NetworkProfile::builder().duplicate_rate(1.0).build();
    let mut sim = two_machines(profile);
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let conn = socket.accept().await?;
            loop {
                match conn.read(Duration::from_millis(500)).await {
                    Ok(payload) => env.debug(format!("read {}", text(&payload))),
                    Err(SimError::Timeout) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            conn.write("once")?;
            env.delay(Duration::from_secs(1)).await?;
            Ok(())
        })
    });

    let report = sim.run();
    assert_eq!(report.messages_from("server:main"), vec!["started", "read once", "finished"]);
    assert!(report.network.packets_duplicated > 0);
}

// =============================================================================
// Handshake and connect failures
// =============================================================================

fn connect_outcome(report: &SimReport) -> Vec<&str> {
    report
        .messages_from("local:main")
        .into_iter()
        .filter(|m| m.starts_with("error") || m.starts_with("connected"))
        .collect()
}

#[test_log::test]
fn test_no_listener_is_unreachable_after_deadline() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let result = env.connect_timeout(("server", 80), Duration::from_secs(2)).await;
            env.debug(format!("failed at {:?}", env.now()));
            result.map(drop)
        })
    });

    let report = sim.run();
    assert_eq!(connect_outcome(&report), vec!["error: no route to host server:80"]);
    assert!(report.messages_from("local:main").contains(&"failed at 2s"));
}

#[test]
fn test_full_backlog_refuses_with_reset() {
    let mut sim = Simulation::new(SimConfig::default().with_accept_backlog(1));
    sim.link("local", "server", NetworkProfile::default())
        .link("early", "server", NetworkProfile::default());
    sim.add_script("server", |env| async move {
        // listens without ever accepting
        let _socket = env.bind(80);
        let _ = env.delay(Duration::from_secs(3)).await;
    });
    sim.add_script("early", |env| {
        logged(env, |env| async move {
            let _conn = env.connect(("server", 80)).await?;
            env.delay(Duration::from_secs(2)).await?;
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            env.delay(Duration::from_millis(500)).await?;
            let conn = env.connect(("server", 80)).await?;
            env.debug(format!("connected {}", conn.local()));
            Ok(())
        })
    });

    let report = sim.run();
    assert_eq!(connect_outcome(&report), vec!["error: connection reset by server:80"]);
}

#[test]
fn test_lost_ack_resets_both_sides() {
    let profile = NetworkProfile::builder().drop_flag(Flag::Ack).build();
    let mut sim = two_machines(profile);
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let result = socket.accept_timeout(Duration::from_secs(8)).await;
            env.debug(format!("accept {:?}", result.map(|_| ())));
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            // the client sees SYN|ACK and considers itself connected
            let conn = env.connect(("server", 80)).await?;
            env.debug("connected");
            conn.read(Duration::from_secs(20)).await?;
            Ok(())
        })
    });

    let report = sim.run();
    assert_eq!(
        connect_outcome(&report),
        vec!["connected", "error: connection reset by server:80"]
    );
    assert!(report.messages_from("server:main").contains(&"accept Err(Timeout)"));
    assert_eq!(report.network.dropped_filtered, 1);
}

#[test]
fn test_lost_syn_ack_times_out() {
    let profile = NetworkProfile::builder().drop_flag(Flag::SynAck).build();
    let mut sim = two_machines(profile);
    sim.add_script("server", |env| async move {
        let _socket = env.bind(80);
        let _ = env.delay(Duration::from_secs(10)).await;
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            env.connect_timeout(("server", 80), Duration::from_secs(3))
                .await
                .map(drop)
        })
    });

    let report = sim.run();
    // the server is listening, the client just never heard its answer
    assert_eq!(connect_outcome(&report), vec!["error: timeout occurred"]);
}

#[test]
fn test_slow_listener_times_out_instead_of_unreachable() {
    let profile = NetworkProfile::builder()
        .fixed_latency(Duration::from_millis(10))
        .build();
    let mut sim = two_machines(profile);
    sim.add_script("server", |env| async move {
        let _socket = env.bind(80);
        let _ = env.delay(Duration::from_secs(1)).await;
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let result = env.connect_timeout(("server", 80), Duration::from_millis(5)).await;
            env.debug(format!("failed at {:?}", env.now()));
            result.map(drop)
        })
    });

    let report = sim.run();
    assert_eq!(connect_outcome(&report), vec!["error: timeout occurred"]);
    assert!(report.messages_from("local:main").contains(&"failed at 5ms"));
}

#[test]
fn test_server_that_never_accepts_times_out_reads() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("server", |env| async move {
        let _socket = env.bind(80);
        let _ = env.delay(Duration::from_secs(5)).await;
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            conn.write("anyone?")?;
            conn.read(Duration::from_secs(1)).await?;
            Ok(())
        })
    });

    let report = sim.run();
    assert!(report.messages_from("local:main").contains(&"error: timeout occurred"));
}

// =============================================================================
// Connections and sockets
// =============================================================================

#[test]
fn test_each_outbound_connection_gets_its_own_port() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            for _ in 0..3 {
                let conn = socket.accept().await?;
                env.debug(format!("from {}", conn.remote()));
                env.spawn(async move {
                    // echo until the client goes away
                    while let Ok(payload) = conn.recv().await {
                        if conn.write(payload).is_err() {
                            break;
                        }
                    }
                });
            }
            env.delay(Duration::from_secs(2)).await?;
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let mut conns = Vec::new();
            for _ in 0..3 {
                conns.push(env.connect(("server", 80)).await?);
            }
            for (n, conn) in conns.iter().enumerate() {
                conn.write(format!("conn-{n}"))?;
            }
            for conn in &conns {
                let echoed = conn.read(Duration::from_secs(1)).await?;
                env.debug(format!("{} got {}", conn.local().port(), text(&echoed)));
            }
            Ok(())
        })
    });

    let report = sim.run();
    let local = report.messages_from("local:main");
    assert!(local.contains(&"49152 got conn-0"));
    assert!(local.contains(&"49153 got conn-1"));
    assert!(local.contains(&"49154 got conn-2"));
    assert!(report.messages_from("server:main").contains(&"from local:49154"));
}

#[test_log::test]
fn test_parallel_connections_are_isolated() {
    let mut sim = two_machines(NetworkProfile::reversing());
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            for _ in 0..3 {
                let conn = socket.accept().await?;
                env.debug(format!("accepted {}", conn.remote()));
                env.spawn(async move {
                    if let Ok(request) = conn.recv().await {
                        let _ = conn.write(format!("reply to {}", text(&request)));
                        // keep the connection until the client is done
                        let _ = conn.recv().await;
                    }
                });
            }
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let attempts = (0..3).map(|n| {
                let env = env.clone();
                async move {
                    let conn = env.connect(("server", 80)).await?;
                    conn.write(format!("request-{n}"))?;
                    let reply = conn.read(Duration::from_secs(5)).await?;
                    Ok::<_, SimError>(text(&reply))
                }
            });
            for (n, result) in futures::future::join_all(attempts).await.into_iter().enumerate() {
                env.debug(format!("{n}: {}", result?));
            }
            Ok(())
        })
    });

    let report = sim.run();
    let mut accepted: Vec<_> = report
        .messages_from("server:main")
        .into_iter()
        .filter(|m| m.starts_with("accepted"))
        .collect();
    assert_eq!(accepted.len(), 3);
    accepted.sort_unstable();
    accepted.dedup();
    assert_eq!(accepted.len(), 3, "remote endpoints must differ");
    assert_eq!(
        report.messages_from("local:main"),
        vec![
            "started",
            "0: reply to request-0",
            "1: reply to request-1",
            "2: reply to request-2",
            "finished"
        ]
    );
}

#[test]
fn test_accept_dropped_after_arrival_keeps_the_connection() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            use futures::future::{select, Either};

            let socket = env.bind(80)?;
            // the timer and the final ACK land at the same instant
            let timer_won = {
                let accept = socket.accept();
                let timer = env.delay(Duration::from_millis(30));
                futures::pin_mut!(accept, timer);
                let winner = select(timer, accept).await;
                matches!(winner, Either::Left(_))
            };
            env.debug(format!("timer won: {timer_won}"));
            let conn = socket.accept_timeout(Duration::from_millis(1)).await?;
            let request = conn.read(Duration::from_secs(1)).await?;
            conn.write(format!("late {}", text(&request)))?;
            env.delay(Duration::from_millis(100)).await?;
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            conn.write("Hello")?;
            let reply = conn.read(Duration::from_secs(1)).await?;
            env.debug(format!("reply {}", text(&reply)));
            Ok(())
        })
    });

    let report = sim.run();
    assert!(report.messages_from("server:main").contains(&"timer won: true"));
    assert!(report.messages_from("local:main").contains(&"reply late Hello"));
}

#[test]
fn test_bind_twice_fails() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.add_script("server", |env| async move {
        let first = env.bind(80);
        let second = env.bind(80);
        env.debug(format!("{:?} {:?}", first.is_ok(), second.err()));
    });

    let report = sim.run();
    assert!(report
        .messages_from("server:main")
        .contains(&"true Some(AddressInUse(server:80))"));
}

#[test]
fn test_second_concurrent_accept_is_rejected() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.add_script("server", |env| async move {
        let Ok(socket) = env.bind(80) else {
            return;
        };
        let socket = std::rc::Rc::new(socket);
        let waiting = socket.clone();
        let task_env = env.clone();
        env.spawn(async move {
            let result = waiting.accept_timeout(Duration::from_secs(1)).await;
            task_env.debug(format!("first {:?}", result.map(|_| ())));
        });
        env.delay(Duration::from_millis(10)).await.ok();
        let second = socket.accept().await;
        env.debug(format!("second {:?}", second.map(|_| ())));
    });

    let report = sim.run();
    let messages = report.messages_from("server:main");
    assert!(messages.contains(&"second Err(AlreadyWaiting)"));
    assert!(messages.contains(&"first Err(Timeout)"));
}

#[test]
fn test_write_does_not_advance_time_and_fails_after_close() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("server", |env| async move {
        if let Ok(socket) = env.bind(80) {
            let _ = socket.accept_timeout(Duration::from_secs(1)).await;
        }
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            let before = env.now();
            conn.write("fire")?;
            conn.write("and forget")?;
            env.debug(format!("elapsed {:?}", env.now() - before));
            conn.close();
            env.debug(format!("after close {:?}", conn.write("late")));
            Ok(())
        })
    });

    let report = sim.run();
    let local = report.messages_from("local:main");
    assert!(local.contains(&"elapsed 0ns"));
    assert!(local.contains(&"after close Err(Closed)"));
}

#[test]
fn test_data_before_reset_is_still_readable() {
    let mut sim = two_machines(NetworkProfile::default());
    sim.add_script("server", |env| {
        logged(env, |env| async move {
            let socket = env.bind(80)?;
            let conn = socket.accept().await?;
            conn.write("last words")?;
            // dropping the connection sends RESET right behind the data
            Ok(())
        })
    });
    sim.add_script("local", |env| {
        logged(env, |env| async move {
            let conn = env.connect(("server", 80)).await?;
            env.delay(Duration::from_secs(1)).await?;
            let first = conn.read(Duration::from_secs(1)).await?;
            env.debug(format!("read {}", text(&first)));
            conn.read(Duration::from_secs(1)).await?;
            Ok(())
        })
    });

    let report = sim.run();
    assert_eq!(
        connect_outcome(&report),
        vec!["error: connection reset by server:80"]
    );
    assert!(report.messages_from("local:main").contains(&"read last words"));
}
