use storage::Storage;

#[tokio::test]
async fn channel_history_survives_reopen_and_continues_sequence() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("history.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let (channel, alice) = {
        let storage = Storage::new(&database_url).await.expect("db");
        let alice = storage
            .create_user("alice", "hash", "salt")
            .await
            .expect("insert")
            .expect("alice");
        let server = storage.create_server("home", alice).await.expect("server");
        let channel = storage
            .list_channels_for_server(server.server_id)
            .await
            .expect("channels")[0]
            .channel_id;
        for text in ["a", "b"] {
            storage
                .insert_message(channel, alice, text)
                .await
                .expect("insert");
        }
        storage.pool().close().await;
        (channel, alice)
    };

    let storage = Storage::new(&database_url).await.expect("reopen");
    let next = storage
        .insert_message(channel, alice, "c")
        .await
        .expect("insert");
    assert_eq!(next.seq, 3);

    let page = storage
        .list_channel_messages(channel, 50, None)
        .await
        .expect("history");
    let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["c", "b", "a"]);
    assert!(page.iter().all(|m| m.sender_username == "alice"));
}
