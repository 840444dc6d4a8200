// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end runtime scenarios: many tasks, multiple workers, channels
//! crossing tasks, select, arenas and pools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metal0_rt::{
    bounded, spawn, unbounded, with_arena, yield_now, Pool, Runtime, RuntimeConfig, Select,
    SelectError, TaskError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn ten_thousand_tasks_yield_once() {
    init_tracing();
    let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10_000 {
        let done = done.clone();
        rt.spawn(async move {
            yield_now().await;
            done.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }
    rt.run().unwrap();

    let stats = rt.stats();
    assert_eq!(done.load(Ordering::Relaxed), 10_000);
    assert_eq!(stats.total_spawned, 10_000);
    assert_eq!(stats.total_completed, 10_000);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(rt.queued(), 0);
    assert_eq!(rt.pending(), 0);
}

#[test]
fn multi_worker_runs_everything_once() {
    init_tracing();
    let rt = Runtime::new(RuntimeConfig::default().with_processors(4).with_work_stealing(true))
        .unwrap();
    let hits = Arc::new(Mutex::new(vec![0u8; 2_000]));
    for i in 0..2_000 {
        let hits = hits.clone();
        rt.spawn(async move {
            if i % 3 == 0 {
                yield_now().await;
            }
            hits.lock().unwrap()[i] += 1;
            Ok(())
        });
    }
    rt.run().unwrap();

    assert!(hits.lock().unwrap().iter().all(|&h| h == 1));
    assert_eq!(rt.stats().total_completed, 2_000);
    assert_eq!(rt.queued(), 0);
}

#[test]
fn tasks_spawn_children() {
    let rt = Runtime::new(RuntimeConfig::default().with_processors(2)).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    rt.spawn(async move {
        let mut handles = Vec::new();
        for _ in 0..50 {
            let c = c.clone();
            handles.push(spawn(async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?);
        }
        for h in handles {
            h.await?;
        }
        Ok(())
    });
    rt.run().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 50);
    assert_eq!(rt.stats().total_spawned, 51);
}

#[test]
fn spawn_outside_runtime_fails() {
    assert!(spawn(async { Ok(()) }).is_err());
}

#[test]
fn producer_consumer_across_workers() {
    init_tracing();
    let rt = Runtime::new(RuntimeConfig::default().with_processors(3)).unwrap();
    let (tx, rx) = bounded::<u64>(4);
    let total = Arc::new(Mutex::new(0u64));

    for p in 0..3u64 {
        let tx = tx.clone();
        rt.spawn(async move {
            for i in 0..100 {
                tx.send(p * 1_000 + i).await?;
            }
            Ok(())
        });
    }
    drop(tx);

    let t = total.clone();
    rt.spawn(async move {
        let mut sum = 0;
        while let Ok(v) = rx.recv().await {
            sum += v;
        }
        *t.lock().unwrap() = sum;
        Ok(())
    });
    rt.run().unwrap();

    let expected: u64 = (0..3u64).map(|p| (0..100).map(|i| p * 1_000 + i).sum::<u64>()).sum();
    assert_eq!(*total.lock().unwrap(), expected);
    assert_eq!(rt.stats().total_failed, 0);
}

#[test]
fn select_waits_for_whichever_channel_fires() {
    let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
    let (fast_tx, fast_rx) = unbounded::<&'static str>();
    let (_slow_tx, slow_rx) = unbounded::<&'static str>();
    let picked = Arc::new(Mutex::new(None));

    let p = picked.clone();
    rt.spawn(async move {
        let (mut slow, mut fast) = (None, None);
        let mut sel = Select::new();
        sel.recv(&slow_rx, &mut slow);
        let f = sel.recv(&fast_rx, &mut fast);
        let idx = sel.execute().await?;
        drop(sel);
        assert_eq!(idx, f);
        *p.lock().unwrap() = fast;
        Ok(())
    });
    rt.spawn(async move {
        metal0_rt::sleep(Duration::from_millis(5)).await;
        fast_tx.send("go").await?;
        Ok(())
    });
    rt.run().unwrap();
    assert_eq!(*picked.lock().unwrap(), Some("go"));
}

#[test]
fn select_error_surfaces_as_task_failure() {
    let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
    let h = rt.spawn(async {
        let mut sel = Select::new();
        sel.execute().await?;
        Ok(())
    });
    rt.run().unwrap();
    assert!(matches!(h.try_result(), Some(Err(TaskError::Select(SelectError::NoCases)))));
    assert_eq!(rt.stats().total_failed, 1);
}

#[test]
fn each_task_gets_its_own_arena() {
    let rt = Runtime::new(RuntimeConfig::default().with_processors(2)).unwrap();
    let lens = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8usize {
        let lens = lens.clone();
        rt.spawn(async move {
            let n = with_arena(|arena| {
                let s = arena.alloc_str(&"x".repeat(i + 1)).map(|s| s.len());
                (s, arena.total_allocated())
            });
            yield_now().await;
            let (s, used) = n.ok_or_else(|| TaskError::failed("no arena"))?;
            lens.lock().unwrap().push((s.map_err(|e| TaskError::failed(e.to_string()))?, used));
            Ok(())
        });
    }
    rt.run().unwrap();

    let mut lens = lens.lock().unwrap().clone();
    lens.sort();
    assert_eq!(lens.len(), 8);
    for (i, (s, used)) in lens.into_iter().enumerate() {
        assert_eq!(s, i + 1);
        // A recycled arena is reset before reuse.
        assert_eq!(used, i + 1);
    }
    assert!(with_arena(|_| ()).is_none());
}

#[test]
fn fixed_pool_of_three() {
    let made = Arc::new(AtomicUsize::new(0));
    let m = made.clone();
    let pool = Pool::new(3, move || {
        m.fetch_add(1, Ordering::Relaxed);
        Vec::<u8>::with_capacity(64)
    });

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();
    assert!(pool.acquire().is_none());

    pool.release(b);
    let d = pool.acquire().unwrap();
    assert_eq!(made.load(Ordering::Relaxed), 3);

    let stats = pool.stats();
    assert_eq!(stats.total_created, 3);
    assert_eq!(stats.total_reused, 1);
    assert_eq!(stats.in_use, 3);
    drop((a, c, d));
}

#[test]
fn sleep_parks_without_blocking_worker() {
    let rt = Runtime::new(RuntimeConfig::single_threaded()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    rt.spawn(async move {
        metal0_rt::sleep(Duration::from_millis(20)).await;
        o.lock().unwrap().push("sleeper");
        Ok(())
    });
    let o = order.clone();
    rt.spawn(async move {
        o.lock().unwrap().push("busy");
        Ok(())
    });
    let start = Instant::now();
    rt.run().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert_eq!(*order.lock().unwrap(), vec!["busy", "sleeper"]);
}
