use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use veilbox_shared::{MessageRef, Salt, UserId};
use veilbox_store::{InboxSummary, RelayStore};

fn shared_store() -> Arc<RelayStore> {
    Arc::new(RelayStore::new(Salt::generate()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutual_blocks_never_deadlock() {
    let store = shared_store();

    let rounds = (0..200).map(|i| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let a = UserId(i * 2);
            let b = UserId(i * 2 + 1);
            store.start_chat(a, b).await;
            store.start_chat(b, a).await;

            let s1 = Arc::clone(&store);
            let s2 = Arc::clone(&store);
            let (r1, r2) = tokio::join!(
                tokio::spawn(async move { s1.block(a, b).await }),
                tokio::spawn(async move { s2.block(b, a).await }),
            );
            r1.unwrap();
            r2.unwrap();

            assert!(!store.is_chatting(a).await);
            assert!(!store.is_chatting(b).await);
            assert!(store.is_blocked(a, b).await);
            assert!(store.is_blocked(b, a).await);
        })
    });

    let results = tokio::time::timeout(Duration::from_secs(10), join_all(rounds))
        .await
        .expect("blocking each other must not deadlock");
    for result in results {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_keep_per_sender_order() {
    let store = shared_store();
    let receiver = UserId(1);
    let senders = 8;
    let per_sender = 50;

    let tasks = (0..senders).map(|s| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let sender = UserId(100 + s);
            for m in 0..per_sender {
                store
                    .enqueue(sender, receiver, MessageRef(s * 1000 + m))
                    .await;
            }
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(
        store.inbox_summary(receiver).await,
        InboxSummary {
            senders: senders as usize,
            messages: (senders * per_sender) as usize,
        }
    );

    let mut drained = 0;
    while let Some((sender, messages)) = store.pop_one_sender(receiver).await {
        let s = sender.0 - 100;
        let expected: Vec<_> = (0..per_sender).map(|m| MessageRef(s * 1000 + m)).collect();
        assert_eq!(messages, expected);
        drained += 1;
    }
    assert_eq!(drained, senders);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn block_races_with_target_start_chat() {
    // Whatever the interleaving, the blocker never keeps an edge and the
    // target's edge never points at the blocker once both finish.
    for i in 0..100 {
        let store = shared_store();
        let owner = UserId(1);
        let target = UserId(2);
        store.start_chat(owner, target).await;
        store.start_chat(target, owner).await;

        let s1 = Arc::clone(&store);
        let s2 = Arc::clone(&store);
        let third = UserId(3 + i);
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { s1.block(owner, target).await }),
            tokio::spawn(async move { s2.start_chat(target, third).await }),
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(store.partner_of(owner).await, None);
        assert_ne!(store.partner_of(target).await, Some(owner));
    }
}

#[tokio::test]
async fn sweeping_while_busy_keeps_state() {
    let store = shared_store();
    let users: Vec<_> = (0..64).map(UserId).collect();

    let writers = users.iter().map(|user| {
        let store = Arc::clone(&store);
        let user = *user;
        tokio::spawn(async move {
            store.enqueue(UserId(999), user, MessageRef(user.0)).await;
        })
    });
    let sweeper = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for _ in 0..16 {
                store.purge_idle().await;
                tokio::task::yield_now().await;
            }
        })
    };

    for result in join_all(writers).await {
        result.unwrap();
    }
    sweeper.await.unwrap();

    for user in users {
        assert_eq!(store.inbox_summary(user).await.messages, 1);
    }
}
