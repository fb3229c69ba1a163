use crux_core::testing::AppTester;
use pretty_assertions::assert_eq;
use shared::capabilities::{MapOperation, StoreOperation};
use shared::codec::parse_collection;
use shared::config::EditorConfig;
use shared::dataset::{FeatureRef, FileFailure, LoadError, LoadedFile};
use shared::event::UserIdentity;
use shared::model::{AppState, DatasetId, NotificationKind, Position, SessionId, VersionToken};
use shared::presentation::{apply, HeadlessMap, MapPresentation};
use shared::schema::FieldValue;
use shared::session::{FormValue, SessionPhase};
use shared::sync::{CommitReceipt, SyncError};
use shared::{App, Effect, Event, Model, Screen};

const COMMERCES: &str = "data/commerces_actifs.geojson";
const EQUIPEMENTS: &str = "data/equipements_publics.geojson";

const CONFIG: &str = r#"
files = ["data/commerces_actifs.geojson", "data/equipements_publics.geojson"]

[repo]
owner = "studio-noble-val"
name = "pat-rufisque"

[fields]
boolean_fields = ["ouvert"]
date_fields = ["date_releve"]
dropdown_fields = ["statut"]
excluded_fields = ["id"]
"#;

const COMMERCES_JSON: &str = r#"{"type":"FeatureCollection","features":[
  {"type":"Feature","geometry":{"type":"Point","coordinates":[-17.24,14.72]},
   "properties":{"id":1,"nom":"Boulangerie Médina","type":"commerce","statut":"actif","ouvert":1,"date_releve":"2024-03-05"}},
  {"type":"Feature","geometry":{"type":"Point","coordinates":[-17.26,14.71]},
   "properties":{"id":2,"nom":"Quincaillerie","type":"commerce","statut":"fermé","ouvert":0,"date_releve":null}},
  {"type":"Feature","geometry":{"type":"LineString","coordinates":[[0,0],[1,1]]},
   "properties":{"id":3,"nom":"Route"}}
]}"#;

const EQUIPEMENTS_JSON: &str = r#"{"type":"FeatureCollection","features":[
  {"type":"Feature","geometry":{"type":"Point","coordinates":[-17.28,14.73]},
   "properties":{"id":9,"name":"Dispensaire","type":"santé","statut":"actif","ouvert":"1"}}
]}"#;

fn feature(file: &str, index: usize) -> FeatureRef {
    FeatureRef {
        dataset: DatasetId::new(file),
        index,
    }
}

fn loaded_files() -> Vec<LoadedFile> {
    vec![
        LoadedFile {
            id: DatasetId::new(COMMERCES),
            collection: parse_collection(COMMERCES_JSON).unwrap(),
            version: VersionToken::new("t1"),
        },
        LoadedFile {
            id: DatasetId::new(EQUIPEMENTS),
            collection: parse_collection(EQUIPEMENTS_JSON).unwrap(),
            version: VersionToken::new("e1"),
        },
    ]
}

fn map_ops(effects: &[Effect]) -> Vec<MapOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Map(request) => Some(request.operation.clone()),
            _ => None,
        })
        .collect()
}

fn store_ops(effects: &[Effect]) -> Vec<StoreOperation> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Store(request) => Some(request.operation.clone()),
            _ => None,
        })
        .collect()
}

fn active_session(model: &Model) -> SessionId {
    model.session.active().unwrap().id.clone()
}

/// Configured, signed in and loaded; returns the map as rendered so far.
fn ready(app: &AppTester<App, Effect>, model: &mut Model) -> HeadlessMap {
    let config = EditorConfig::from_toml_str(CONFIG).unwrap();
    app.update(Event::Configure(Box::new(config)), model);
    app.update(Event::SignInRequested, model);
    app.update(
        Event::SignInCompleted(Box::new(Ok(UserIdentity {
            login: "mainteneur".into(),
        }))),
        model,
    );
    let update = app.update(
        Event::DatasetsLoaded {
            generation: model.load_generation,
            result: Box::new(Ok(loaded_files())),
        },
        model,
    );

    let mut map = HeadlessMap::new();
    for op in map_ops(&update.effects) {
        apply(&mut map, &op);
    }
    map
}

#[test]
fn test_sign_in_and_load() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    // 1. Configure
    let config = EditorConfig::from_toml_str(CONFIG).unwrap();
    app.update(Event::Configure(Box::new(config)), &mut model);
    assert!(model.config.is_some());

    // 2. Credential check goes to the shell
    let update = app.update(Event::SignInRequested, &mut model);
    assert_eq!(model.state, AppState::Authenticating);
    assert_eq!(store_ops(&update.effects), vec![StoreOperation::ValidateCredential]);
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Render(_))));

    // 3. Accepted credential starts the load
    let update = app.update(
        Event::SignInCompleted(Box::new(Ok(UserIdentity {
            login: "mainteneur".into(),
        }))),
        &mut model,
    );
    assert_eq!(model.state, AppState::Loading);
    assert_eq!(
        store_ops(&update.effects),
        vec![StoreOperation::LoadAll {
            files: vec![DatasetId::new(COMMERCES), DatasetId::new(EQUIPEMENTS)]
        }]
    );

    // 4. Loaded files become layers, in configuration order
    let update = app.update(
        Event::DatasetsLoaded {
            generation: model.load_generation,
            result: Box::new(Ok(loaded_files())),
        },
        &mut model,
    );
    assert_eq!(model.state, AppState::Ready);
    let mut map = HeadlessMap::new();
    for op in map_ops(&update.effects) {
        apply(&mut map, &op);
    }
    let layers = map.layers();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[0].name, "commerces actifs");
    assert_eq!(layers[0].style.color, "#e6194B");
    assert_eq!(layers[0].style.radius, 7);
    assert_eq!(layers[1].style.color, "#3cb44b");
    // The line string is not rendered.
    assert_eq!(layers[0].markers.len(), 2);
    assert_eq!(layers[0].markers[0].spec.label.as_deref(), Some("Boulangerie Médina"));
    assert_eq!(layers[1].markers[0].spec.label.as_deref(), Some("Dispensaire"));

    let view = app.view(&model);
    assert_eq!(view.user.as_deref(), Some("mainteneur"));
    match view.screen {
        Screen::Map { layers, editor } => {
            assert_eq!(layers.len(), 2);
            assert_eq!(layers[0].version, "t1");
            assert!(editor.is_none());
        }
        other => panic!("unexpected screen {other:?}"),
    }
}

#[test]
fn test_rejected_credential_returns_to_sign_in() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let config = EditorConfig::from_toml_str(CONFIG).unwrap();
    app.update(Event::Configure(Box::new(config)), &mut model);
    app.update(Event::SignInRequested, &mut model);

    let update = app.update(
        Event::SignInCompleted(Box::new(Err(SyncError::Auth {
            status: 401,
            message: "Bad credentials".into(),
        }))),
        &mut model,
    );

    assert_eq!(model.state, AppState::Unauthenticated);
    assert_eq!(store_ops(&update.effects), vec![StoreOperation::ClearCredential]);
    let note = model.notification.clone().unwrap();
    assert_eq!(note.kind, NotificationKind::Error);
    assert!(note.message.contains("invalid or has expired"));
}

#[test]
fn test_stale_load_result_is_dropped() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    // A reload supersedes the first batch.
    let update = app.update(Event::ReloadRequested, &mut model);
    let removed = map_ops(&update.effects)
        .into_iter()
        .filter(|op| matches!(op, MapOperation::RemoveDataset { .. }))
        .count();
    assert_eq!(removed, 2);
    assert!(model.store.is_empty());

    let update = app.update(
        Event::DatasetsLoaded {
            generation: model.load_generation - 1,
            result: Box::new(Ok(loaded_files())),
        },
        &mut model,
    );
    assert!(update.effects.is_empty());
    assert_eq!(model.state, AppState::Loading);
    assert!(model.layers.is_empty());
}

#[test]
fn test_failed_batch_names_files_and_shows_nothing() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let config = EditorConfig::from_toml_str(CONFIG).unwrap();
    app.update(Event::Configure(Box::new(config)), &mut model);
    app.update(
        Event::SignInCompleted(Box::new(Ok(UserIdentity { login: "m".into() }))),
        &mut model,
    );

    let update = app.update(
        Event::DatasetsLoaded {
            generation: model.load_generation,
            result: Box::new(Err(LoadError {
                failures: vec![FileFailure {
                    file: DatasetId::new(EQUIPEMENTS),
                    error: SyncError::Fetch {
                        path: EQUIPEMENTS.into(),
                        status: 404,
                        message: "Not Found".into(),
                    },
                }],
            })),
        },
        &mut model,
    );

    assert!(map_ops(&update.effects).is_empty());
    assert!(model.store.is_empty());
    assert_eq!(
        model.notification.clone().unwrap().message,
        "Could not load data/equipements_publics.geojson"
    );
}

#[test]
fn test_opening_second_feature_restores_first() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let mut map = ready(&app, &mut model);

    // 1. Open A
    let update = app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    let session_a = active_session(&model);
    let origin = Position::new(-17.24, 14.72).unwrap();
    assert_eq!(
        map_ops(&update.effects),
        vec![
            MapOperation::PlaceDraggableMarker {
                session: session_a.clone(),
                position: origin
            },
            MapOperation::SetMarkerVisibility {
                feature: feature(COMMERCES, 0),
                visible: false
            },
        ]
    );
    for op in map_ops(&update.effects) {
        apply(&mut map, &op);
    }
    app.update(
        Event::FieldChanged {
            name: "nom".into(),
            value: FormValue::Text("Autre nom".into()),
        },
        &mut model,
    );

    // 2. Open B while A is open
    let update = app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(EQUIPEMENTS),
            index: 0,
        },
        &mut model,
    );
    let session_b = active_session(&model);
    assert_ne!(session_a, session_b);
    assert_eq!(
        map_ops(&update.effects),
        vec![
            MapOperation::SetMarkerVisibility {
                feature: feature(COMMERCES, 0),
                visible: true
            },
            MapOperation::RemoveDraggableMarker {
                session: session_a.clone()
            },
            MapOperation::PlaceDraggableMarker {
                session: session_b.clone(),
                position: Position::new(-17.28, 14.73).unwrap()
            },
            MapOperation::SetMarkerVisibility {
                feature: feature(EQUIPEMENTS, 0),
                visible: false
            },
        ]
    );
    for op in map_ops(&update.effects) {
        apply(&mut map, &op);
    }

    assert!(map.marker(&feature(COMMERCES, 0)).unwrap().visible);
    assert!(!map.marker(&feature(EQUIPEMENTS, 0)).unwrap().visible);
    assert_eq!(map.proxy().map(|(id, _)| id.clone()), Some(session_b));
    // A's form edit was discarded with its session.
    assert!(model.session.active().unwrap().form.is_empty());
}

#[test]
fn test_non_point_features_cannot_be_selected() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    let update = app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 2,
        },
        &mut model,
    );
    assert!(map_ops(&update.effects).is_empty());
    assert!(!model.session.is_editing());
}

#[test]
fn test_save_commits_and_closes_session() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 1,
        },
        &mut model,
    );
    let session = active_session(&model);
    app.update(
        Event::FieldChanged {
            name: "ouvert".into(),
            value: FormValue::Checkbox(true),
        },
        &mut model,
    );
    let moved = Position::new(-17.27, 14.70).unwrap();
    app.update(Event::ProxyMoved { position: moved }, &mut model);

    // The editor shows the uncommitted value.
    match app.view(&model).screen {
        Screen::Map {
            editor: Some(editor),
            ..
        } => {
            assert_eq!(editor.title, "Quincaillerie");
            assert_eq!(editor.dataset, "commerces actifs");
            assert!(editor.save_enabled);
            let ouvert = editor.fields.iter().find(|f| f.key == "ouvert").unwrap();
            assert_eq!(ouvert.value, FieldValue::Checked(true));
        }
        other => panic!("unexpected screen {other:?}"),
    }

    // 1. Save sends the whole file with the version it was loaded at
    let update = app.update(Event::SaveRequested, &mut model);
    let ops = store_ops(&update.effects);
    assert_eq!(ops.len(), 1);
    let StoreOperation::Commit(request) = &ops[0] else {
        panic!("expected a commit, got {ops:?}");
    };
    assert_eq!(request.file, DatasetId::new(COMMERCES));
    assert_eq!(request.expected, VersionToken::new("t1"));
    assert_eq!(request.feature_label.as_deref(), Some("Quincaillerie"));
    assert_eq!(request.collection.features.len(), 3);
    let props = request.collection.features[1].properties.as_ref().unwrap();
    assert_eq!(props["ouvert"], serde_json::json!(1));

    // 2. A second save while in flight is ignored
    let update = app.update(Event::SaveRequested, &mut model);
    assert!(store_ops(&update.effects).is_empty());

    // 3. Success advances the version and closes the session
    let update = app.update(
        Event::CommitFinished {
            session: session.clone(),
            result: Box::new(Ok(CommitReceipt {
                file: DatasetId::new(COMMERCES),
                version: VersionToken::new("t2"),
                commit_sha: "c1".into(),
                commit_url: None,
            })),
        },
        &mut model,
    );
    assert_eq!(
        map_ops(&update.effects),
        vec![
            MapOperation::MoveMarker {
                feature: feature(COMMERCES, 1),
                position: moved
            },
            MapOperation::SetMarkerVisibility {
                feature: feature(COMMERCES, 1),
                visible: true
            },
            MapOperation::RemoveDraggableMarker { session },
        ]
    );
    assert!(!model.session.is_editing());
    assert_eq!(
        model.store.get(&DatasetId::new(COMMERCES)).unwrap().version,
        VersionToken::new("t2")
    );
    assert_eq!(model.notification.clone().unwrap().kind, NotificationKind::Success);
}

#[test]
fn test_conflict_keeps_session_and_edits() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    let session = active_session(&model);
    app.update(
        Event::FieldChanged {
            name: "statut".into(),
            value: FormValue::Text("fermé".into()),
        },
        &mut model,
    );
    app.update(Event::SaveRequested, &mut model);

    let update = app.update(
        Event::CommitFinished {
            session: session.clone(),
            result: Box::new(Err(SyncError::Stale {
                path: COMMERCES.into(),
                expected: VersionToken::new("t1"),
                found: VersionToken::new("t2"),
            })),
        },
        &mut model,
    );

    assert!(map_ops(&update.effects).is_empty());
    let active = model.session.active().unwrap();
    assert_eq!(active.id, session);
    assert_eq!(active.phase, SessionPhase::SaveFailed);
    assert_eq!(active.form["statut"], FormValue::Text("fermé".into()));
    assert_eq!(
        model.store.get(&DatasetId::new(COMMERCES)).unwrap().version,
        VersionToken::new("t1")
    );
    let note = model.notification.clone().unwrap();
    assert_eq!(note.kind, NotificationKind::Error);
    assert!(note.message.contains("changed on the server"));

    match app.view(&model).screen {
        Screen::Map {
            editor: Some(editor),
            ..
        } => {
            assert!(editor.save_enabled);
            assert!(editor.save_failed);
        }
        other => panic!("unexpected screen {other:?}"),
    }

    // Save is available again.
    let update = app.update(Event::SaveRequested, &mut model);
    assert_eq!(store_ops(&update.effects).len(), 1);
}

#[test]
fn test_remote_conflict_message_reaches_notification() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    let session = active_session(&model);
    app.update(Event::SaveRequested, &mut model);

    app.update(
        Event::CommitFinished {
            session: session.clone(),
            result: Box::new(Err(SyncError::Conflict {
                path: COMMERCES.into(),
                status: 409,
                message: "data/commerces_actifs.geojson does not match 0123abcd".into(),
            })),
        },
        &mut model,
    );

    let note = model.notification.clone().unwrap();
    assert_eq!(note.kind, NotificationKind::Error);
    assert!(note.message.contains("changed on the server"));
    assert!(note
        .message
        .contains("data/commerces_actifs.geojson does not match 0123abcd"));
    assert_eq!(model.session.active().unwrap().id, session);
}

#[test]
fn test_impossible_date_refuses_save() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);
    let before = model.store.clone();

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    app.update(
        Event::FieldChanged {
            name: "date_releve".into(),
            value: FormValue::Date("2024-02-30".into()),
        },
        &mut model,
    );
    let update = app.update(Event::SaveRequested, &mut model);

    assert!(store_ops(&update.effects).is_empty());
    assert_eq!(model.store, before);
    assert_eq!(model.session.active().unwrap().phase, SessionPhase::Editing);
    let note = model.notification.clone().unwrap();
    assert_eq!(note.kind, NotificationKind::Error);
    assert!(note.message.contains("2024-02-30"));
}

#[test]
fn test_cancel_after_failed_save_restores_feature() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);
    let before = model.store.clone();

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    let session = active_session(&model);
    app.update(
        Event::FieldChanged {
            name: "nom".into(),
            value: FormValue::Text("Boulangerie Médina II".into()),
        },
        &mut model,
    );
    app.update(Event::SaveRequested, &mut model);
    app.update(
        Event::CommitFinished {
            session: session.clone(),
            result: Box::new(Err(SyncError::Rejected {
                path: COMMERCES.into(),
                status: 422,
                message: "Invalid request".into(),
            })),
        },
        &mut model,
    );
    assert_ne!(model.store, before);

    let update = app.update(Event::CancelRequested, &mut model);
    assert_eq!(
        map_ops(&update.effects),
        vec![
            MapOperation::SetMarkerVisibility {
                feature: feature(COMMERCES, 0),
                visible: true
            },
            MapOperation::RemoveDraggableMarker { session },
        ]
    );
    assert_eq!(model.store, before);
}

#[test]
fn test_commit_auth_failure_signs_out() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    let session = active_session(&model);
    app.update(Event::SaveRequested, &mut model);

    let update = app.update(
        Event::CommitFinished {
            session,
            result: Box::new(Err(SyncError::Auth {
                status: 401,
                message: "Bad credentials".into(),
            })),
        },
        &mut model,
    );

    assert_eq!(model.state, AppState::Unauthenticated);
    assert!(model.user.is_none());
    assert!(model.store.is_empty());
    assert!(!model.session.is_editing());
    assert!(store_ops(&update.effects).contains(&StoreOperation::ClearCredential));
    let removed = map_ops(&update.effects)
        .into_iter()
        .filter(|op| matches!(op, MapOperation::RemoveDataset { .. }))
        .count();
    assert_eq!(removed, 2);
    assert_eq!(app.view(&model).screen, Screen::SignIn { validating: false });
}

#[test]
fn test_result_for_replaced_session_is_ignored() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let _map = ready(&app, &mut model);

    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 0,
        },
        &mut model,
    );
    let first = active_session(&model);
    app.update(Event::SaveRequested, &mut model);
    app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(COMMERCES),
            index: 1,
        },
        &mut model,
    );
    let second = active_session(&model);

    let update = app.update(
        Event::CommitFinished {
            session: first,
            result: Box::new(Ok(CommitReceipt {
                file: DatasetId::new(COMMERCES),
                version: VersionToken::new("t2"),
                commit_sha: "c1".into(),
                commit_url: None,
            })),
        },
        &mut model,
    );

    assert!(map_ops(&update.effects).is_empty());
    assert_eq!(active_session(&model), second);
    assert_eq!(
        model.store.get(&DatasetId::new(COMMERCES)).unwrap().version,
        VersionToken::new("t1")
    );
    assert_eq!(model.notification.clone().unwrap().kind, NotificationKind::Info);
}

#[test]
fn test_sign_out_tears_everything_down() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();
    let mut map = ready(&app, &mut model);

    let update = app.update(
        Event::FeatureClicked {
            dataset: DatasetId::new(EQUIPEMENTS),
            index: 0,
        },
        &mut model,
    );
    for op in map_ops(&update.effects) {
        apply(&mut map, &op);
    }

    let update = app.update(Event::SignOutRequested, &mut model);
    for op in map_ops(&update.effects) {
        apply(&mut map, &op);
    }

    assert!(map.layers().is_empty());
    assert!(map.proxy_position().is_none());
    assert!(store_ops(&update.effects).contains(&StoreOperation::ClearCredential));
    assert_eq!(model.state, AppState::Unauthenticated);
    assert!(model.notification.is_none());
}
