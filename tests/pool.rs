use std::os::unix::io::AsRawFd;
use std::time::Duration;

use stilt::{PoolKind, PoolState, Ready, Socket, SocketError, SocketPool};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_driver(pool: &SocketPool) -> tokio::task::JoinHandle<Result<(), stilt::PoolError>> {
    pool.prepare().unwrap();
    let driver = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await })
    };
    // give the driver a moment to enter its first wait
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.state(), PoolState::Running);
    driver
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suspend_resumes_on_readable() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, b) = Socket::pair().unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(a.read(&mut buf), Err(SocketError::Blocked)));

    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    b.write(b"hi").unwrap();
    waiter.await.unwrap().unwrap();
    assert_eq!(a.read(&mut buf).unwrap(), 2);

    pool.stop();
    driver.await.unwrap().unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suspend_resumes_on_writable() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, _b) = Socket::pair().unwrap();
    // a fresh socket is immediately writable
    pool.suspend(a.as_raw_fd(), Ready::writable()).await.unwrap();

    pool.stop();
    driver.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_resumes_reader() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, b) = Socket::pair().unwrap();
    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(b);
    // the waiter must wake; a half-closed peer may surface as either a
    // readable EOF or a disconnect
    let resumed = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter never resumed")
        .unwrap();
    match resumed {
        Ok(()) => {
            let mut buf = [0u8; 8];
            assert_eq!(a.read(&mut buf).unwrap(), 0);
        }
        Err(SocketError::Disconnected) => {}
        Err(err) => panic!("unexpected resume: {err}"),
    }

    pool.stop();
    driver.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_pending_waiters() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, _b) = Socket::pair().unwrap();
    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.stop();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(SocketError::Cancelled)
    ));
    driver.await.unwrap().unwrap();

    // suspending against a stopped pool fails immediately
    assert!(matches!(
        pool.suspend(a.as_raw_fd(), Ready::readable()).await,
        Err(SocketError::Cancelled)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_waiter_deregisters_cleanly() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, b) = Socket::pair().unwrap();
    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // cancel the suspended task; its registration must unwind
    waiter.abort();
    let _ = waiter.await;

    // the descriptor can be waited on again afterwards
    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.write(b"x").unwrap();
    waiter.await.unwrap().unwrap();

    pool.stop();
    driver.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiple_waiters_resume_in_append_order() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, b) = Socket::pair().unwrap();
    let fd = a.as_raw_fd();

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    b.write(b"x").unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    pool.stop();
    driver.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_backend_round_trip() {
    init_logging();
    let pool = SocketPool::new(PoolKind::poll());
    let driver = start_driver(&pool).await;

    let (a, b) = Socket::pair().unwrap();
    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.write(b"poll").unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("poll backend never resumed the waiter")
        .unwrap()
        .unwrap();

    pool.stop();
    driver.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_driver_cancels_waiters() {
    init_logging();
    let pool = SocketPool::new(PoolKind::Auto);
    let driver = start_driver(&pool).await;

    let (a, _b) = Socket::pair().unwrap();
    let waiter = {
        let pool = pool.clone();
        let fd = a.as_raw_fd();
        tokio::spawn(async move { pool.suspend(fd, Ready::readable()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    driver.abort();
    let _ = driver.await;

    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter leaked past driver teardown")
            .unwrap(),
        Err(SocketError::Cancelled)
    ));
    assert_eq!(pool.state(), PoolState::Stopped);
}
