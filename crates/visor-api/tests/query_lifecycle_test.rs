//! Query lifecycle tests against a fully assembled server core.
//!
//! Training images are served by a wiremock server or written to a temp
//! directory; the dataset is a synthetic in-memory index.

mod common;

use std::time::{Duration, Instant};

use common::*;
use visor_core::{AnnotationLabel, Error, FeatureMatrix, QueryState, ServerEvent};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn image_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/img/\d+\.png$"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(png_bytes([200, 40, 40])),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_guards_before_training() {
    let f = fixture();
    let manager = f.manager();
    let id = manager.start_query(Some("cat"));

    assert!(matches!(manager.rank(&id, true), Err(Error::WrongQueryStatus(_))));
    assert!(matches!(manager.get_ranking(&id, 1), Err(Error::CannotReturnRanking(_))));
    assert!(matches!(manager.train(&id, true), Err(Error::Training(_))));
    assert_eq!(manager.query(&id).unwrap().state(), QueryState::DataColl);

    assert!(matches!(
        manager.add_trs(&id, &[]),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        manager.add_trs("no-such-query", &["http://x/a.png".to_string()]),
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_free_query_twice() {
    let f = fixture();
    let manager = f.manager();
    let id = manager.start_query(None);
    assert_eq!(manager.query(&id).unwrap().tag(), id);

    manager.free_query(&id).unwrap();
    let err = manager.free_query(&id).unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(ref msg) if msg.contains("does not exist")));
    assert_eq!(manager.query_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ingestion_counts_only_successful_downloads() {
    let server = image_server().await;
    let f = fixture();
    let manager = f.manager();
    let mut rx = f.subscribe();

    let id = manager.start_query(Some("cat"));
    let urls: Vec<String> = (0..50)
        .map(|i| {
            if i % 10 == 9 {
                format!("{}/missing/{}.png", server.uri(), i)
            } else {
                format!("{}/img/{}.png", server.uri(), i)
            }
        })
        .collect();
    manager.add_trs(&id, &urls).unwrap();
    wait_all_processed(&mut rx, &id).await;

    let query = manager.query(&id).unwrap();
    assert_eq!(query.positive_count(), 45);
    assert_eq!(query.positive_feats().rows(), 45);
    assert_eq!(query.state(), QueryState::DataCollComplete);
    assert!(f.cache_dir.join("cat").is_dir());

    // Collection is closed: further images are ignored.
    manager.add_trs(&id, &urls[..3]).unwrap();
    assert_eq!(query.positive_count(), 45);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_train_and_rank_notify_state_changes() {
    let server = image_server().await;
    let f = fixture();
    let manager = f.manager();
    let mut rx = f.subscribe();

    let id = manager.start_query(Some("red"));
    let urls: Vec<String> = (0..5).map(|i| format!("{}/img/{}.png", server.uri(), i)).collect();
    manager.add_trs(&id, &urls).unwrap();
    wait_all_processed(&mut rx, &id).await;

    manager.train(&id, false).unwrap();
    let trained = |e: &ServerEvent| {
        matches!(e, ServerEvent::QueryStateChanged { id: q, state: QueryState::Trained } if *q == id)
    };
    wait_for(&mut rx, trained).await;

    manager.rank(&id, false).unwrap();
    let ranked = |e: &ServerEvent| {
        matches!(e, ServerEvent::QueryStateChanged { id: q, state: QueryState::Ranked } if *q == id)
    };
    wait_for(&mut rx, ranked).await;

    let page = manager.get_ranking(&id, 1).unwrap();
    assert_eq!(page.page_count, DATASET_SIZE.div_ceil(PAGE_SIZE));
    assert_eq!(page.rlist.len(), PAGE_SIZE);
    assert!(page.rlist.windows(2).all(|w| w[0].score >= w[1].score));

    // Ranking again needs a fresh model.
    assert!(matches!(manager.rank(&id, true), Err(Error::WrongQueryStatus(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_train_failure_rolls_back_and_posts_error() {
    let f = fixture_with_negatives(FeatureMatrix::with_cols(DIM));
    let manager = f.manager();
    let mut rx = f.subscribe();

    let local = f.dir.path().join("local/a.png");
    write_png(&local, [10, 200, 10]);
    let id = manager.start_query(Some("green"));
    let paths = vec![local.display().to_string()];
    let qid = id.clone();
    blocking(manager, move |m| m.add_trs_from_file(&qid, &paths, true))
        .await
        .unwrap();
    assert_eq!(manager.query(&id).unwrap().state(), QueryState::DataCollComplete);

    manager.train(&id, false).unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, ServerEvent::QueryError { .. })).await;
    match event {
        ServerEvent::QueryError { id: q, err_msg } => {
            assert_eq!(q, id);
            assert!(err_msg.contains("negative pool is empty"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(manager.query(&id).unwrap().state(), QueryState::DataCollComplete);

    // The blocking variant reports the same failure to the caller.
    let qid = id.clone();
    let result = blocking(manager, move |m| m.train(&qid, true)).await;
    assert!(matches!(result, Err(Error::Training(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_files_annotations_and_classifier() {
    let f = fixture();
    let manager = f.manager();

    let outside = f.dir.path().join("local");
    let mut paths = Vec::new();
    for (i, color) in [[250, 0, 0], [220, 30, 0], [240, 10, 20]].iter().enumerate() {
        let path = outside.join(format!("pos_{}.png", i));
        write_png(&path, *color);
        paths.push(path.display().to_string());
    }
    // A dataset member: its stored row is reused.
    let member = f.dataset_dir.join(dataset_name(3));
    write_png(&member, [0, 0, 250]);
    paths.push(member.display().to_string());

    let id = manager.start_query(Some("red"));
    let (qid, files) = (id.clone(), paths.clone());
    blocking(manager, move |m| m.add_trs_from_file(&qid, &files, true))
        .await
        .unwrap();
    let query = manager.query(&id).unwrap();
    assert_eq!(query.positive_count(), 4);
    let row = query
        .positive_paths()
        .iter()
        .position(|p| p == &member.display().to_string())
        .unwrap();
    assert_eq!(query.positive_feats().row(row), synthetic_rows(DATASET_SIZE, 0).row(3));

    // Annotations: dataset members relative to the dataset, others verbatim.
    let anno_file = f.dir.path().join("red.txt");
    assert_eq!(manager.save_annotations(&id, &anno_file).unwrap(), 4);
    let annotations = manager.get_annotations(&anno_file).unwrap();
    assert_eq!(annotations.len(), 4);
    assert!(annotations.iter().all(|a| a.anno == AnnotationLabel::Positive));
    assert!(annotations.iter().any(|a| a.path == dataset_name(3)));

    // Classifier persistence.
    let cls_file = f.dir.path().join("red.json");
    assert!(matches!(
        manager.save_classifier(&id, &cls_file),
        Err(Error::WrongQueryStatus(_))
    ));
    let qid = id.clone();
    blocking(manager, move |m| {
        m.train(&qid, true)?;
        m.rank(&qid, true)
    })
    .await
    .unwrap();
    manager.save_classifier(&id, &cls_file).unwrap();

    let other = manager.start_query(Some("red-again"));
    manager.load_classifier(&other, &cls_file).unwrap();
    assert_eq!(manager.query(&other).unwrap().state(), QueryState::Trained);
    let oid = other.clone();
    blocking(manager, move |m| m.rank(&oid, true)).await.unwrap();

    let original = manager.get_ranking(&id, 1).unwrap();
    let reloaded = manager.get_ranking(&other, 1).unwrap();
    assert_eq!(original, reloaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_dataset_images_posts_index_update() {
    let f = fixture();
    let manager = f.manager();
    let mut rx = f.subscribe();

    let names: Vec<String> = (0..3).map(|i| format!("new/extra_{}.png", i)).collect();
    for (i, name) in names.iter().enumerate() {
        write_png(&f.dataset_dir.join(name), [i as u8 * 60, 100, 100]);
    }

    let added = blocking(manager, {
        let names = names.clone();
        move |m| m.add_dset_images_to_index(&names)
    })
    .await
    .unwrap();
    assert_eq!(added, 3);
    assert_eq!(manager.index().len(), DATASET_SIZE + 3);
    let event = wait_for(&mut rx, |e| matches!(e, ServerEvent::IndexUpdated { .. })).await;
    assert!(matches!(event, ServerEvent::IndexUpdated { images_added: 3, success: true, .. }));

    let outside = f.dir.path().join("elsewhere.png");
    write_png(&outside, [1, 1, 1]);
    let paths = vec![outside.display().to_string()];
    let result = blocking(manager, move |m| m.add_dset_images_to_index(&paths)).await;
    assert!(matches!(result, Err(Error::InvalidDsetIncrementalUpdate(_))));
    let event = wait_for(&mut rx, |e| matches!(e, ServerEvent::IndexUpdated { .. })).await;
    assert!(matches!(event, ServerEvent::IndexUpdated { success: false, .. }));
    assert_eq!(manager.index().len(), DATASET_SIZE + 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_extractor_keeps_ingestion_moving() {
    let mut extractor = extractor_config().with_batch_size(8);
    extractor.batch_timeout_ms = 2_000;
    let f = fixture_with_extractor(extractor);
    let manager = f.manager();

    let paths: Vec<String> = (0..12)
        .map(|i| {
            let path = f.dir.path().join(format!("local/b_{}.png", i));
            write_png(&path, [i as u8 * 20, 50, 50]);
            path.display().to_string()
        })
        .collect();

    let id = manager.start_query(Some("batched"));
    let start = Instant::now();
    let qid = id.clone();
    blocking(manager, move |m| m.add_trs_from_file(&qid, &paths, true))
        .await
        .unwrap();

    // One image at a time reaches the extractor; none waits out the timeout.
    assert!(start.elapsed() < Duration::from_millis(2_000));
    assert_eq!(manager.query(&id).unwrap().positive_count(), 12);
}
