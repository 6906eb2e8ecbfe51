// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for sandboxes, processes and their byte streams.
//!
//! These tests verify:
//! 1. Sandbox creation carries the definition and resources
//! 2. stdout resumes from the last entry id without duplicating output
//! 3. Concurrent stdin writers never share a sequence index
//! 4. Exit codes, tunnels and snapshots are interpreted correctly
//! 5. Exec resolves (and caches) the task id and streams process output

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{FakeBackend, client_for, init_tracing};
use modal_protocol::api::{self, FileDescriptor, GenericStatus, methods};
use modal_sdk::{ExecOptions, Sandbox, SandboxOptions, SdkError, StdioBehavior};
use tokio::io::AsyncReadExt;
use tonic::Status;

fn serve_create(backend: &FakeBackend) {
    backend.on(methods::SANDBOX_CREATE, |_req: api::SandboxCreateRequest| {
        Ok(api::SandboxCreateResponse {
            sandbox_id: "sb-1".to_string(),
        })
    });
}

fn logs(entry_id: &str, data: &str, eof: bool) -> Result<api::TaskLogsBatch, Status> {
    Ok(api::TaskLogsBatch {
        task_id: "ta-1".to_string(),
        items: vec![api::TaskLogs {
            data: data.to_string(),
            file_descriptor: FileDescriptor::Stdout as i32,
            ..Default::default()
        }],
        entry_id: entry_id.to_string(),
        eof,
    })
}

fn eof_only() -> Result<api::TaskLogsBatch, Status> {
    Ok(api::TaskLogsBatch {
        eof: true,
        ..Default::default()
    })
}

fn result(status: GenericStatus, exitcode: i32) -> api::GenericResult {
    api::GenericResult {
        status: status as i32,
        exitcode,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_sends_definition() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    let client = client_for(&backend);

    let sandbox = Sandbox::create(
        &client,
        "ap-1",
        "im-1",
        SandboxOptions {
            command: vec!["sleep".into(), "10".into()],
            timeout: Some(Duration::from_secs(600)),
            cpu: Some(1.5),
            memory_mb: Some(2048),
        },
    )
    .await
    .unwrap();
    assert_eq!(sandbox.sandbox_id(), "sb-1");

    let creates: Vec<api::SandboxCreateRequest> = backend.requests(methods::SANDBOX_CREATE);
    assert_eq!(creates[0].app_id, "ap-1");
    let definition = creates[0].definition.as_ref().unwrap();
    assert_eq!(definition.entrypoint_args, vec!["sleep", "10"]);
    assert_eq!(definition.image_id, "im-1");
    assert_eq!(definition.timeout_secs, 600);
    let resources = definition.resources.as_ref().unwrap();
    assert_eq!(resources.milli_cpu, 1500);
    assert_eq!(resources.memory_mb, 2048);
}

#[tokio::test]
async fn test_stdout_resumes_after_disconnect() {
    init_tracing();
    let backend = FakeBackend::new();
    serve_create(&backend);
    backend.on_stream(methods::SANDBOX_GET_LOGS, |req: api::SandboxGetLogsRequest| {
        if req.file_descriptor != FileDescriptor::Stdout as i32 {
            return Ok(vec![eof_only()]);
        }
        Ok(match req.last_entry_id.as_str() {
            // the first call ends without eof, as the backend does periodically
            "0-0" => vec![logs("1-0", "hello ", false)],
            // the backend replays the last entry before continuing
            "1-0" => vec![logs("1-0", "hello ", false), logs("2-0", "world", true)],
            other => panic!("unexpected cursor {other}"),
        })
    });
    let client = client_for(&backend);

    let mut sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();
    assert_eq!(sandbox.stdout.read_text().await.unwrap(), "hello world");
    assert_eq!(sandbox.stderr.read_text().await.unwrap(), "");

    let stdout_cursors: Vec<String> = backend
        .requests::<api::SandboxGetLogsRequest>(methods::SANDBOX_GET_LOGS)
        .into_iter()
        .filter(|r| r.file_descriptor == FileDescriptor::Stdout as i32)
        .map(|r| r.last_entry_id)
        .collect();
    assert_eq!(stdout_cursors, vec!["0-0", "1-0"]);
}

#[tokio::test(start_paused = true)]
async fn test_stdout_error_after_retry_budget() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    backend.on_stream(methods::SANDBOX_GET_LOGS, |req: api::SandboxGetLogsRequest| {
        if req.file_descriptor != FileDescriptor::Stdout as i32 {
            return Ok(vec![eof_only()]);
        }
        Err(Status::unavailable("logs unavailable"))
    });
    let client = client_for(&backend);

    let mut sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();
    let err = sandbox.stdout.read_text().await.unwrap_err();
    assert!(err.to_string().contains("logs unavailable"));

    let stdout_opens = backend
        .requests::<api::SandboxGetLogsRequest>(methods::SANDBOX_GET_LOGS)
        .into_iter()
        .filter(|r| r.file_descriptor == FileDescriptor::Stdout as i32)
        .count();
    assert_eq!(stdout_opens, 1 + modal_sdk::STREAM_RETRY_BUDGET as usize);
}

#[tokio::test]
async fn test_concurrent_stdin_writes_get_unique_indices() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    backend.on(methods::SANDBOX_STDIN_WRITE, |_req: api::SandboxStdinWriteRequest| {
        Ok(api::Empty {})
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let writers: Vec<_> = (0..16)
        .map(|i| {
            let stdin = sandbox.stdin.clone();
            tokio::spawn(async move { stdin.write(format!("line {i}\n")).await })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    sandbox.stdin.close().await.unwrap();
    sandbox.stdin.close().await.unwrap();

    let writes: Vec<api::SandboxStdinWriteRequest> =
        backend.requests(methods::SANDBOX_STDIN_WRITE);
    assert_eq!(writes.len(), 17);
    let mut indices: Vec<u32> = writes.iter().map(|w| w.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (1..=17).collect::<Vec<_>>());

    let last = writes.last().unwrap();
    assert!(last.eof);
    assert_eq!(last.index, 17);
    assert!(last.input.is_empty());

    let err = sandbox.stdin.write("late").await.unwrap_err();
    assert!(matches!(err, SdkError::Invalid(_)));
}

#[tokio::test]
async fn test_failed_stdin_write_does_not_consume_index() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    let fail_next = Arc::new(Mutex::new(true));
    let flag = fail_next.clone();
    backend.on(methods::SANDBOX_STDIN_WRITE, move |_req: api::SandboxStdinWriteRequest| {
        let mut fail = flag.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(Status::permission_denied("not yet"));
        }
        Ok(api::Empty {})
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    assert!(sandbox.stdin.write("a").await.is_err());
    sandbox.stdin.write("a").await.unwrap();

    let writes: Vec<api::SandboxStdinWriteRequest> =
        backend.requests(methods::SANDBOX_STDIN_WRITE);
    assert_eq!(writes.iter().map(|w| w.index).collect::<Vec<_>>(), vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_and_poll_exit_codes() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    let finished = Arc::new(Mutex::new(None::<api::GenericResult>));
    let state = finished.clone();
    backend.on_delayed(methods::SANDBOX_WAIT, move |req: api::SandboxWaitRequest| {
        let result = state.lock().unwrap().clone();
        let delay = if result.is_none() {
            Duration::from_secs_f32(req.timeout)
        } else {
            Duration::ZERO
        };
        Ok((api::SandboxWaitResponse { result }, delay))
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    assert_eq!(sandbox.poll().await.unwrap(), None);

    let setter = {
        let finished = finished.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            *finished.lock().unwrap() = Some(result(GenericStatus::Failure, 3));
        })
    };
    assert_eq!(sandbox.wait().await.unwrap(), 3);
    setter.await.unwrap();

    let waits: Vec<api::SandboxWaitRequest> = backend.requests(methods::SANDBOX_WAIT);
    assert_eq!(waits[0].timeout, 0.0);
    assert!(waits[1..].iter().all(|w| w.timeout == 55.0));

    *finished.lock().unwrap() = Some(result(GenericStatus::Terminated, 0));
    assert_eq!(sandbox.poll().await.unwrap(), Some(137));
    *finished.lock().unwrap() = Some(result(GenericStatus::Timeout, 0));
    assert_eq!(sandbox.poll().await.unwrap(), Some(124));
    *finished.lock().unwrap() = Some(result(GenericStatus::Unspecified, 0));
    assert_eq!(sandbox.poll().await.unwrap(), None);
}

#[tokio::test]
async fn test_from_id() {
    let backend = FakeBackend::new();
    backend.on(methods::SANDBOX_WAIT, |req: api::SandboxWaitRequest| {
        if req.sandbox_id == "sb-1" {
            Ok(api::SandboxWaitResponse::default())
        } else {
            Err(Status::not_found("no such sandbox"))
        }
    });
    let client = client_for(&backend);

    let sandbox = Sandbox::from_id(&client, "sb-1").await.unwrap();
    assert_eq!(sandbox.sandbox_id(), "sb-1");

    let err = Sandbox::from_id(&client, "sb-missing").await.unwrap_err();
    assert!(matches!(err, SdkError::NotFound(ref m) if m.contains("sb-missing")));
}

#[tokio::test]
async fn test_tunnels_are_cached() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    backend.on(methods::SANDBOX_GET_TUNNELS, |req: api::SandboxGetTunnelsRequest| {
        assert_eq!(req.timeout, 50.0);
        Ok(api::SandboxGetTunnelsResponse {
            result: Some(result(GenericStatus::Success, 0)),
            tunnels: vec![
                api::TunnelData {
                    host: "a.modal.host".into(),
                    port: 443,
                    container_port: 8000,
                    ..Default::default()
                },
                api::TunnelData {
                    host: "b.modal.host".into(),
                    port: 443,
                    unencrypted_host: Some("r.modal.host".into()),
                    unencrypted_port: Some(40123),
                    container_port: 5432,
                },
            ],
        })
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let tunnels = sandbox.tunnels(Duration::from_secs(50)).await.unwrap();
    assert_eq!(tunnels.len(), 2);
    assert_eq!(tunnels[&8000].url(), "https://a.modal.host");
    assert_eq!(tunnels[&5432].tcp_socket().unwrap(), ("r.modal.host", 40123));

    let again = sandbox.tunnels(Duration::from_secs(50)).await.unwrap();
    assert_eq!(again, tunnels);
    assert_eq!(backend.count(methods::SANDBOX_GET_TUNNELS), 1);
}

#[tokio::test]
async fn test_tunnels_timeout() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    backend.on(methods::SANDBOX_GET_TUNNELS, |_req: api::SandboxGetTunnelsRequest| {
        Ok(api::SandboxGetTunnelsResponse {
            result: Some(result(GenericStatus::Timeout, 0)),
            tunnels: Vec::new(),
        })
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let err = sandbox.tunnels(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, SdkError::SandboxTimeout(_)));
}

#[tokio::test]
async fn test_snapshot_filesystem() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    let responses = Arc::new(Mutex::new(vec![
        api::SandboxSnapshotFsResponse {
            image_id: "im-snap".into(),
            result: Some(result(GenericStatus::Success, 0)),
        },
        api::SandboxSnapshotFsResponse {
            image_id: String::new(),
            result: Some(api::GenericResult {
                exception: "disk full".into(),
                ..result(GenericStatus::Failure, 1)
            }),
        },
        api::SandboxSnapshotFsResponse::default(),
    ]));
    backend.on(methods::SANDBOX_SNAPSHOT_FS, move |_req: api::SandboxSnapshotFsRequest| {
        Ok(responses.lock().unwrap().remove(0))
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let timeout = Duration::from_secs(55);
    assert_eq!(sandbox.snapshot_filesystem(timeout).await.unwrap(), "im-snap");

    let err = sandbox.snapshot_filesystem(timeout).await.unwrap_err();
    assert!(matches!(err, SdkError::Execution(ref m) if m.contains("disk full")));

    let err = sandbox.snapshot_filesystem(timeout).await.unwrap_err();
    assert!(matches!(err, SdkError::Execution(ref m) if m.contains("image id")));
}

fn serve_exec(backend: &FakeBackend) {
    backend.on(methods::SANDBOX_GET_TASK_ID, |_req: api::SandboxGetTaskIdRequest| {
        Ok(api::SandboxGetTaskIdResponse {
            task_id: Some("ta-1".into()),
            task_result: None,
        })
    });
    backend.on(methods::CONTAINER_EXEC, |req: api::ContainerExecRequest| {
        assert_eq!(req.task_id, "ta-1");
        Ok(api::ContainerExecResponse {
            exec_id: "ex-1".into(),
        })
    });
    backend.on(methods::CONTAINER_EXEC_WAIT, |_req: api::ContainerExecWaitRequest| {
        Ok(api::ContainerExecWaitResponse {
            exit_code: Some(7),
            completed: true,
        })
    });
    backend.on(methods::CONTAINER_EXEC_PUT_INPUT, |_req: api::ContainerExecPutInputRequest| {
        Ok(api::Empty {})
    });
    backend.on(methods::SANDBOX_TERMINATE, |_req: api::SandboxTerminateRequest| {
        Ok(api::SandboxTerminateResponse::default())
    });
    backend.on_stream(
        methods::CONTAINER_EXEC_GET_OUTPUT,
        |req: api::ContainerExecGetOutputRequest| {
            let text = if req.file_descriptor == FileDescriptor::Stdout as i32 {
                "out"
            } else {
                "err"
            };
            let batch = |index: u64, data: &str, exit_code: Option<i32>| -> Result<_, Status> {
                Ok(api::RuntimeOutputBatch {
                    items: vec![api::RuntimeOutputMessage {
                        file_descriptor: req.file_descriptor,
                        message_bytes: data.as_bytes().to_vec(),
                        ..Default::default()
                    }],
                    batch_index: index,
                    exit_code,
                })
            };
            Ok(match req.last_batch_index {
                0 => vec![batch(1, text, None)],
                _ => vec![batch(2, "!", Some(7))],
            })
        },
    );
}

#[tokio::test]
async fn test_exec_streams_output_and_waits() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    serve_exec(&backend);
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let mut process = sandbox
        .exec(
            vec!["python".into(), "-c".into(), "print('out')".into()],
            ExecOptions {
                workdir: Some("/tmp".into()),
                timeout: Some(Duration::from_secs(30)),
                secret_ids: vec!["st-1".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(process.exec_id(), "ex-1");

    process.stdin.write("input").await.unwrap();
    process.stdin.close().await.unwrap();

    let mut stdout = String::new();
    process.stdout.read_to_string(&mut stdout).await.unwrap();
    assert_eq!(stdout, "out!");
    assert_eq!(process.stderr.read_text().await.unwrap(), "err!");
    assert_eq!(process.wait().await.unwrap(), 7);

    let execs: Vec<api::ContainerExecRequest> = backend.requests(methods::CONTAINER_EXEC);
    assert_eq!(execs[0].command, vec!["python", "-c", "print('out')"]);
    assert_eq!(execs[0].workdir.as_deref(), Some("/tmp"));
    assert_eq!(execs[0].timeout_secs, 30);
    assert_eq!(execs[0].secret_ids, vec!["st-1"]);

    let inputs: Vec<api::ContainerExecPutInputRequest> =
        backend.requests(methods::CONTAINER_EXEC_PUT_INPUT);
    let messages: Vec<_> = inputs.iter().map(|i| i.input.clone().unwrap()).collect();
    assert_eq!(messages[0].message_index, 1);
    assert_eq!(messages[0].message, b"input".to_vec());
    assert_eq!(messages[1].message_index, 2);
    assert!(messages[1].eof);

    let cursors: Vec<u64> = backend
        .requests::<api::ContainerExecGetOutputRequest>(methods::CONTAINER_EXEC_GET_OUTPUT)
        .into_iter()
        .filter(|r| r.file_descriptor == FileDescriptor::Stdout as i32)
        .map(|r| r.last_batch_index)
        .collect();
    assert_eq!(cursors, vec![0, 1]);
}

#[tokio::test]
async fn test_task_id_is_cached_until_terminate() {
    let backend = FakeBackend::new();
    serve_create(&backend);
    serve_exec(&backend);
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let ignore = || ExecOptions {
        stdout: StdioBehavior::Ignore,
        stderr: StdioBehavior::Ignore,
        ..Default::default()
    };
    let mut first = sandbox.exec(vec!["true".into()], ignore()).await.unwrap();
    sandbox.exec(vec!["true".into()], ignore()).await.unwrap();
    assert_eq!(backend.count(methods::SANDBOX_GET_TASK_ID), 1);

    // ignored output reads as empty
    assert!(first.stdout.read_to_end_bytes().await.unwrap().is_empty());

    sandbox.terminate().await.unwrap();
    sandbox.exec(vec!["true".into()], ignore()).await.unwrap();
    assert_eq!(backend.count(methods::SANDBOX_GET_TASK_ID), 2);
}

#[tokio::test]
async fn test_exec_requires_running_task() {
    let responses = Arc::new(Mutex::new(vec![
        api::SandboxGetTaskIdResponse {
            task_id: None,
            task_result: None,
        },
        api::SandboxGetTaskIdResponse {
            task_id: Some("ta-1".into()),
            task_result: Some(result(GenericStatus::Success, 0)),
        },
    ]));
    let backend = FakeBackend::new();
    serve_create(&backend);
    backend.on(methods::SANDBOX_GET_TASK_ID, move |_req: api::SandboxGetTaskIdRequest| {
        Ok(responses.lock().unwrap().remove(0))
    });
    let client = client_for(&backend);
    let sandbox = Sandbox::create(&client, "ap-1", "im-1", SandboxOptions::default())
        .await
        .unwrap();

    let err = sandbox.exec(vec!["ls".into()], ExecOptions::default()).await.unwrap_err();
    assert!(matches!(err, SdkError::Execution(ref m) if m.contains("does not have a task id")));

    let err = sandbox.exec(vec!["ls".into()], ExecOptions::default()).await.unwrap_err();
    assert!(matches!(err, SdkError::Execution(ref m) if m.contains("already completed")));
    assert_eq!(backend.count(methods::CONTAINER_EXEC), 0);
}
