//! End-to-end scenarios for the invocation engine: many concurrent calls
//! sharing one executor, nested calls, and streaming cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use modelcall::{
    observer_fn, ByteStream, CallEvent, CallExecutor, CallOptions, ChatChoiceReducer, InvokeError,
    RetryConfig,
};

fn fast_retry(max_attempts: usize) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_factor: 2.0,
        jitter: false,
    }
}

#[tokio::test]
async fn concurrent_calls_share_one_throttle_budget() {
    static CURRENT: AtomicUsize = AtomicUsize::new(0);
    static MAX_OBSERVED: AtomicUsize = AtomicUsize::new(0);

    let executor = CallExecutor::builder().max_concurrent(2).build();
    let mut handles = Vec::new();
    for i in 0..6 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .invoke(CallOptions::new(), move |_cancel| async move {
                    let now = CURRENT.fetch_add(1, Ordering::SeqCst) + 1;
                    MAX_OBSERVED.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    CURRENT.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), i);
    }
    assert!(MAX_OBSERVED.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn every_call_gets_exactly_one_terminal_event() {
    let counts = Arc::new(Mutex::new(std::collections::HashMap::<
        String,
        (usize, usize),
    >::new()));
    let sink = counts.clone();
    let observer = observer_fn(move |event: &CallEvent| {
        let mut counts = sink.lock().unwrap();
        let entry = counts
            .entry(event.metadata().call_id.clone())
            .or_insert((0, 0));
        match event {
            CallEvent::Started { .. } => entry.0 += 1,
            _ => entry.1 += 1,
        }
    });
    let executor = CallExecutor::builder()
        .retry(fast_retry(2))
        .observer(observer)
        .build();

    let mut handles = Vec::new();
    for i in 0..12 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .invoke::<usize, _, _>(CallOptions::new(), move |_cancel| async move {
                    match i % 3 {
                        0 => Ok(i),
                        1 => Err(InvokeError::Http {
                            status: 503,
                            message: "busy".to_string(),
                        }),
                        _ => Err(InvokeError::Validation("malformed".to_string())),
                    }
                })
                .await
        }));
    }
    for handle in handles {
        let _ = handle.await.unwrap();
    }

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 12);
    for (call_id, (started, finished)) in counts.iter() {
        assert_eq!(*started, 1, "{call_id} started more than once");
        assert_eq!(*finished, 1, "{call_id} finished {finished} times");
    }
}

#[tokio::test]
async fn nested_streaming_call_reports_its_parent() {
    let started = Arc::new(Mutex::new(Vec::new()));
    let sink = started.clone();
    let observer = observer_fn(move |event: &CallEvent| {
        if let CallEvent::Started { metadata } = event {
            sink.lock().unwrap().push((
                metadata.function_id.clone(),
                metadata.call_id.clone(),
                metadata.parent_call_id.clone(),
            ));
        }
    });
    let executor = CallExecutor::builder().observer(observer).build();

    let outer = executor
        .invoke(
            CallOptions::new().function_id("orchestrate"),
            |_cancel| async { Ok("planned") },
        )
        .await
        .unwrap();
    assert_eq!(outer, "planned");
    let outer_id = started.lock().unwrap()[0].1.clone();

    let queue = executor
        .invoke_stream(
            CallOptions::new()
                .function_id("stream-text")
                .parent_call_id(outer_id.clone()),
            ChatChoiceReducer::new(),
            |_cancel| async {
                let body = [
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                ];
                let stream: ByteStream = Box::pin(futures::stream::iter(
                    body.into_iter()
                        .map(|c| Ok::<Bytes, InvokeError>(Bytes::copy_from_slice(c.as_bytes()))),
                ));
                Ok(stream)
            },
        )
        .await
        .unwrap();

    let mut reader = queue.reader();
    let mut content = String::new();
    while let Some(item) = reader.next().await {
        content = item.unwrap()[0].content.clone();
    }
    assert_eq!(content, "hi");

    let started = started.lock().unwrap();
    assert_eq!(started.len(), 2);
    assert_eq!(started[1].0.as_deref(), Some("stream-text"));
    assert_eq!(started[1].2.as_deref(), Some(outer_id.as_str()));
}

#[tokio::test]
async fn cancelling_a_stream_mid_transfer_aborts_the_call() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer = observer_fn(move |event: &CallEvent| {
        let tag = match event {
            CallEvent::Started { .. } => "started",
            CallEvent::FinishedSuccess { .. } => "success",
            CallEvent::FinishedError { .. } => "error",
            CallEvent::FinishedAbort { .. } => "abort",
        };
        sink.lock().unwrap().push(tag);
    });
    let executor = CallExecutor::builder().observer(observer).build();
    let cancel = CancellationToken::new();

    let queue = executor
        .invoke_stream(
            CallOptions::new().cancel(cancel.clone()),
            ChatChoiceReducer::new(),
            |_cancel| async {
                // One frame arrives, then the stream stalls forever.
                let first = futures::stream::iter(vec![Ok::<Bytes, InvokeError>(
                    Bytes::from_static(
                        b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial\"}}]}\n\n",
                    ),
                )]);
                let stalled = futures::stream::pending::<Result<Bytes, InvokeError>>();
                let stream: ByteStream = Box::pin(futures::StreamExt::chain(first, stalled));
                Ok(stream)
            },
        )
        .await
        .unwrap();

    let mut reader = queue.reader();
    let choices = reader.next().await.unwrap().unwrap();
    assert_eq!(choices[0].content, "partial");

    cancel.cancel();
    match reader.next().await.unwrap() {
        Err(err) => assert!(err.is_abort()),
        Ok(choices) => panic!("expected abort, got {choices:?}"),
    }
    assert!(reader.next().await.is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*events.lock().unwrap(), vec!["started", "abort"]);
}

#[tokio::test]
async fn timeout_is_a_cancellation_race() {
    let executor = CallExecutor::builder().build();
    let cancel = CancellationToken::new();

    // Caller-side timeout: a timer that fires the shared signal.
    let timer_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        timer_cancel.cancel();
    });

    let err = executor
        .invoke::<(), _, _>(
            CallOptions::new().cancel(cancel),
            |cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(InvokeError::Aborted),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
                }
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_abort());
}
