use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spooltag::dispatch::{MacroSink, MoonrakerClient};
use spooltag::error::{DispatchError, RepositoryError};
use spooltag::inventory::{FilamentQuery, NfcBinder, Repository, SpoolmanClient};
use spooltag::mapping::MappedFields;
use spooltag::reconcile::{Reconciler, ResolvedSpoolIdentity};
use spooltag::sniffer::Sniffer;
use spooltag::tag::fields::{COLOR_HEX, MATERIAL_BASE, VENDOR_NAME};
use spooltag::tag::{FieldMap, NfcId, RawTagPayload, RecordType, TagRecord};
use spooltag::BinaryFormat;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spoolman(server: &MockServer) -> SpoolmanClient {
    SpoolmanClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

fn tag_id() -> NfcId {
    NfcId::from_uid(&[0xAA, 0xBB, 0xCC])
}

fn spool_json(id: u32, filament_id: u32, nfc_id: Option<&str>) -> serde_json::Value {
    let extra = match nfc_id {
        Some(nfc_id) => json!({ "nfc_id": json!(nfc_id).to_string() }),
        None => json!({}),
    };
    json!({ "id": id, "filament": { "id": filament_id }, "extra": extra })
}

// ── Spoolman lookups ────────────────────────────────────────────

#[tokio::test]
async fn spoolman_finds_spool_by_nfc_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            spool_json(1, 1, None),
            spool_json(2, 4, Some("AA:BB:CC")),
        ])))
        .expect(2)
        .mount(&server)
        .await;

    let client = spoolman(&server);
    let spool = client.find_spool_by_nfc_id(&tag_id()).await.unwrap().unwrap();
    assert_eq!(spool.id, 2);
    assert_eq!(spool.filament.id, 4);

    let missing = client
        .find_spool_by_nfc_id(&NfcId::from_uid(&[0x01]))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn spoolman_missing_spool_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool/42"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "not found"})))
        .mount(&server)
        .await;

    assert!(spoolman(&server).get_spool(42).await.unwrap().is_none());
}

#[tokio::test]
async fn spoolman_vendor_lookup_keeps_exact_names_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/vendor"))
        .and(query_param("name", "Acme Corp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "name": "Acme Corporation" },
            { "id": 2, "name": "acme corp" },
        ])))
        .mount(&server)
        .await;

    let vendor = spoolman(&server)
        .find_vendor_by_name("Acme Corp")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(vendor.id, 2);
}

#[tokio::test]
async fn spoolman_filament_lookup_filters_by_attributes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/filament"))
        .and(query_param("vendor.id", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 3, "vendor": { "id": 1, "name": "Acme" }, "material": "PLA", "color_hex": "00ff00" },
            { "id": 4, "vendor": { "id": 1, "name": "Acme" }, "material": "PLA", "color_hex": "ff0000" },
        ])))
        .mount(&server)
        .await;

    let query = FilamentQuery {
        vendor_id: 1,
        material_base: "PLA".to_string(),
        material_modifier: None,
        color_hex: Some("#FF0000".to_string()),
    };
    let filament = spoolman(&server).find_filament(&query).await.unwrap().unwrap();
    assert_eq!(filament.id, 4);
}

// ── Spoolman creates ────────────────────────────────────────────

#[tokio::test]
async fn spoolman_create_spool_records_nfc_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/spool"))
        .and(body_partial_json(json!({
            "filament_id": 4,
            "remaining_weight": 1000.0,
            "extra": { "nfc_id": "\"aa:bb:cc\"", "tag_format": "\"nfc\"" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(spool_json(9, 4, Some("aa:bb:cc"))))
        .expect(1)
        .mount(&server)
        .await;

    let fields = json!({ "remaining_weight": 1000.0, "extra": { "tag_format": "nfc" } });
    let spool = spoolman(&server)
        .create_spool(4, &tag_id(), fields.as_object().unwrap())
        .await
        .unwrap();
    assert_eq!(spool.id, 9);
    assert!(spool.is_bound_to(&tag_id()));
}

fn with_extra(mut spool: serde_json::Value, key: &str, value: &str) -> serde_json::Value {
    spool["extra"][key] = json!(json!(value).to_string());
    spool
}

#[tokio::test]
async fn spoolman_bind_moves_nfc_id() {
    let server = MockServer::start().await;
    let previous = with_extra(spool_json(1, 1, Some("aa:bb:cc")), "tag_format", "nfc");
    let target = with_extra(spool_json(2, 1, None), "color_name", "Signal Red");
    Mock::given(method("GET"))
        .and(path("/api/v1/spool/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(target.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([previous, target])))
        .mount(&server)
        .await;
    // Other extra fields travel with the identifier; Spoolman replaces
    // `extra` wholesale.
    Mock::given(method("PATCH"))
        .and(path("/api/v1/spool/1"))
        .and(body_json(json!({
            "extra": { "nfc_id": "\"\"", "tag_format": "\"nfc\"" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(spool_json(1, 1, None)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/spool/2"))
        .and(body_json(json!({
            "extra": { "nfc_id": "\"aa:bb:cc\"", "color_name": "\"Signal Red\"" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(spool_json(2, 1, Some("aa:bb:cc"))))
        .expect(1)
        .mount(&server)
        .await;

    assert!(spoolman(&server).bind_nfc_id(2, &tag_id()).await.unwrap());
}

#[tokio::test]
async fn spoolman_lists_spools_for_binding() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            spool_json(1, 1, Some("aa:bb:cc")),
            spool_json(2, 3, None),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let spools = spoolman(&server).list_spools().await.unwrap();

    assert_eq!(spools.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
    assert!(spools[0].is_bound_to(&tag_id()));
}

#[tokio::test]
async fn spoolman_bind_unknown_spool_is_false() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool/5"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(!spoolman(&server).bind_nfc_id(5, &tag_id()).await.unwrap());
}

// ── Spoolman failures ───────────────────────────────────────────

#[tokio::test]
async fn spoolman_server_error_is_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool/1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = spoolman(&server).get_spool(1).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Status { status: 500, .. }));
}

#[tokio::test]
async fn spoolman_garbage_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .mount(&server)
        .await;

    let err = spoolman(&server).get_spool(1).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidResponse { .. }));
}

#[tokio::test]
async fn spoolman_unreachable_is_http_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let client = SpoolmanClient::new(&uri, Duration::from_secs(2)).unwrap();
    let err = client.get_spool(1).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Http { .. }));
}

// ── Reconciliation through Spoolman ─────────────────────────────

#[tokio::test]
async fn new_tag_is_created_in_spoolman() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/spool"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/vendor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/vendor"))
        .and(body_partial_json(json!({ "name": "Acme" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "name": "Acme" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/filament"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/filament"))
        .and(body_partial_json(json!({
            "vendor_id": 7,
            "material": "PLA",
            "color_hex": "FF0000",
            "diameter": 1.75,
            "density": 1.24
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 11,
            "vendor": { "id": 7, "name": "Acme" },
            "material": "PLA",
            "color_hex": "FF0000"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/spool"))
        .and(body_partial_json(json!({ "filament_id": 11 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(spool_json(21, 11, Some("aa:bb:cc"))))
        .expect(1)
        .mount(&server)
        .await;

    let mut fields = FieldMap::new();
    fields.insert(VENDOR_NAME, "Acme");
    fields.insert(MATERIAL_BASE, "PLA");
    fields.insert(COLOR_HEX, "#FF0000");
    let record = BinaryFormat::Structured.encode(&fields).unwrap();
    let payload = RawTagPayload::new(
        Some(vec![0xAA, 0xBB, 0xCC]),
        vec![TagRecord::new(RecordType::Mime("application/octet-stream".to_string()), record)],
    );

    let tag = Sniffer::default().sniff(&payload).unwrap();
    let reconciler = Reconciler::new(Arc::new(spoolman(&server)));
    let resolved = reconciler.reconcile(&tag, &MappedFields::default()).await.unwrap();

    assert_eq!(
        resolved,
        ResolvedSpoolIdentity {
            spool_id: 21,
            filament_id: 11
        }
    );
}

// ── Moonraker ───────────────────────────────────────────────────

#[tokio::test]
async fn moonraker_receives_commands() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/printer/command"))
        .and(body_json(json!({
            "commands": ["SET_ACTIVE_SPOOL ID=3", "SET_ACTIVE_FILAMENT ID=2"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "ok" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = MoonrakerClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let commands = vec![
        "SET_ACTIVE_SPOOL ID=3".to_string(),
        "SET_ACTIVE_FILAMENT ID=2".to_string(),
    ];
    client.send_commands(&commands).await.unwrap();
}

#[tokio::test]
async fn moonraker_rejection_and_status_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/printer/command"))
        .and(body_partial_json(json!({ "commands": ["BAD"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 400, "message": "Unknown command: BAD" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/printer/command"))
        .and(body_partial_json(json!({ "commands": ["DOWN"] })))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = MoonrakerClient::new(&server.uri(), Duration::from_secs(5)).unwrap();

    let err = client.send_commands(&["BAD".to_string()]).await.unwrap_err();
    assert!(matches!(err, DispatchError::Rejected(ref m) if m == "Unknown command: BAD"));

    let err = client.send_commands(&["DOWN".to_string()]).await.unwrap_err();
    assert!(matches!(err, DispatchError::Status { status: 503, .. }));
}

#[tokio::test]
async fn moonraker_plain_text_reply_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/printer/command"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = MoonrakerClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
    client.send_commands(&["M117 hi".to_string()]).await.unwrap();
}
