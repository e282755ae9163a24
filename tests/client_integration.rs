use abx_client::capture::{read_capture, write_capture, CaptureHeader};
use abx_client::output::write_json;
use abx_client::{AbxClient, ClientConfig, Error, Record};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn packet(sequence: i32) -> Record {
    let symbol = ["MSFT", "AAPL", "AMZN", "META"][sequence as usize % 4];
    let side = if sequence % 2 == 0 { 'B' } else { 'S' };
    Record { symbol: symbol.into(), side, quantity: sequence * 10, price: 100 + sequence, sequence }
}

/// Minimal ABX server: streams `1..=max` minus `withheld` in ragged chunks,
/// answers resend requests for any sequence. With `close_after_resend` the
/// recovery connection is closed after every answer.
fn spawn_server(max: i32, withheld: Vec<i32>, close_after_resend: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            serve(&mut conn, max, &withheld, close_after_resend);
        }
    });
    port
}

fn serve(conn: &mut TcpStream, max: i32, withheld: &[i32], close_after_resend: bool) {
    let mut req = [0u8; 2];
    while conn.read_exact(&mut req).is_ok() {
        match req[0] {
            1 => {
                let bytes: Vec<u8> = (1..=max)
                    .filter(|s| !withheld.contains(s))
                    .flat_map(|s| packet(s).encode().unwrap())
                    .collect();
                for chunk in bytes.chunks(23) {
                    conn.write_all(chunk).unwrap();
                    conn.flush().unwrap();
                }
                return;
            }
            2 => {
                conn.write_all(&packet(i32::from(req[1])).encode().unwrap()).unwrap();
                if close_after_resend {
                    return;
                }
            }
            _ => return,
        }
    }
}

fn config(port: u16) -> ClientConfig {
    ClientConfig {
        port,
        connect_timeout: Some(Duration::from_secs(2)),
        read_timeout: Some(Duration::from_secs(5)),
        ..ClientConfig::default()
    }
}

fn sequences(records: &abx_client::RecordSet) -> Vec<i32> {
    records.records().map(|r| r.sequence).collect()
}

#[test]
fn end_to_end_recovers_withheld_packets() {
    let port = spawn_server(8, vec![3, 5, 6], false);
    let out = AbxClient::new(config(port)).run().unwrap();
    assert_eq!(sequences(&out.records), (1..=8).collect::<Vec<_>>());
    assert_eq!(out.stream.decoded, 5);
    assert_eq!(out.reconcile.requested, 3);
    assert_eq!(out.reconcile.recovered, 3);
    assert!(out.reconcile.unresolved.is_empty());
    for r in out.records.records() {
        assert_eq!(r, &packet(r.sequence));
    }
}

#[test]
fn reconnect_each_handles_server_closing_after_resend() {
    let port = spawn_server(6, vec![2, 4], true);
    let client = AbxClient::new(ClientConfig { reconnect_each: true, ..config(port) });
    let out = client.run().unwrap();
    assert_eq!(sequences(&out.records), (1..=6).collect::<Vec<_>>());
}

#[test]
fn gap_free_stream_needs_no_recovery() {
    let port = spawn_server(4, vec![], false);
    let out = AbxClient::new(config(port)).run().unwrap();
    assert_eq!(sequences(&out.records), vec![1, 2, 3, 4]);
    assert_eq!(out.reconcile.requested, 0);
}

#[test]
fn connection_refused_is_a_transport_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = AbxClient::new(config(port)).run().unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "{err}");
}

#[test]
fn shutdown_aborts_a_stalled_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut req = [0u8; 2];
        conn.read_exact(&mut req).unwrap();
        conn.write_all(&packet(1).encode().unwrap()[..10]).unwrap();
        ready_tx.send(()).unwrap();
        // Stall with the connection open until the test is over.
        let _ = done_rx.recv_timeout(Duration::from_secs(10));
    });

    let client = AbxClient::new(ClientConfig { read_timeout: None, ..config(port) });
    let shutdown = client.shutdown_handle();
    let worker = thread::spawn(move || client.run());
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    shutdown.shutdown();
    let result = worker.join().unwrap();
    done_tx.send(()).ok();
    assert!(matches!(result, Err(Error::Transport { .. })));
}

#[test]
fn outputs_round_trip_through_files() {
    let port = spawn_server(5, vec![4], false);
    let client = AbxClient::new(config(port));
    let out = client.run().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("nested").join("output.json");
    write_json(&json_path, &out.records).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    let seqs: Vec<i64> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["sequence"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    let cap_path = dir.path().join("run.bin");
    let header = CaptureHeader::new(client.config().endpoint(), &out.records);
    write_capture(&cap_path, header.clone(), &out.records).unwrap();
    let (back_header, back) = read_capture(&cap_path).unwrap();
    assert_eq!(back_header, header);
    assert_eq!(back, out.records);
    assert!(back.is_complete());
}
