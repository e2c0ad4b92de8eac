use std::sync::Arc;

use actix_web::{App, test, web};
use gpioctl::{
    AppConfig, AppState, CommandService, EventBus, EventLevel, Level, MockPinDriver, PinRegistry,
};
use serde_json::{Value, json};

fn sample_state(driver: Arc<MockPinDriver>) -> (AppState, String) {
    let cfg = AppConfig::default();
    let bus = EventBus::from_config(&cfg.events);
    let registry = Arc::new(PinRegistry::new(cfg.gpios.clone(), driver, bus.clone()));
    let service = Arc::new(CommandService::new(registry, bus));

    (AppState::new(service), cfg.http.path.clone())
}

#[actix_rt::test]
async fn list_pins_returns_all() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;
    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(resp["pins"].as_object().unwrap().len(), 26);
    assert_eq!(resp["backend"], "mock");
    assert_eq!(resp["is_hardware"], false);
    assert_eq!(resp["pwm_pins"], json!([12, 13, 18, 19]));
    assert_eq!(resp["valid_pins"][0], 2);

    let pin = &resp["pins"]["17"];
    assert_eq!(pin["mode"], "unconfigured");
    assert_eq!(pin["value"], 0);
    assert_eq!(pin["pull"], "off");
    assert_eq!(pin["configured"], false);
    assert!(pin.get("pwm").is_none());
}

#[actix_rt::test]
async fn invalid_pin_returns_400() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;
    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 99, "mode": "output" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Invalid pin 99");
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/mode").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::post().uri("/api/pins").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn malformed_payload_returns_400() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_payload(r#"{"pin":"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post().uri("/api/write").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn undecodable_commands_are_logged_as_errors() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));
    let mut feed = state.service.subscribe();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for body in [
        json!({ "pin": -1, "mode": "output" }),
        json!({ "mode": "output" }),
        json!({ "pin": "17", "mode": "output" }),
    ] {
        let req = test::TestRequest::post()
            .uri("/api/mode")
            .set_json(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);

        let record = feed.try_next().unwrap();
        assert_eq!(record.level, EventLevel::Error);
        assert!(record.message.starts_with("Error configuring pin: "));
        assert!(feed.try_next().is_none());
    }

    let req = test::TestRequest::post().uri("/api/pwm").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(
        feed.try_next().unwrap().message,
        "Error controlling PWM: Invalid value: Empty payload"
    );
}

#[actix_rt::test]
async fn set_mode_and_value_happy_path() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 4, "mode": "output" }))
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["success"], true);

    let req = test::TestRequest::post()
        .uri("/api/write")
        .set_json(json!({ "pin": 4, "action": "high" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["pins"]["4"]["mode"], "output");
    assert_eq!(resp["pins"]["4"]["value"], 1);
}

#[actix_rt::test]
async fn reject_write_when_not_output() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 17, "mode": "input", "pull": "down" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/write")
        .set_json(json!({ "pin": 17, "action": "high" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Pin 17 is not configured as output");
}

#[actix_rt::test]
async fn invalid_mode_and_action_are_rejected() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 4, "mode": "sideways" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Invalid mode sideways");

    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 18, "action": "explode" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn pulse_ends_low() {
    let driver = Arc::new(MockPinDriver::default());
    let (state, scope_path) = sample_state(driver.clone());

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 5, "mode": "OUTPUT" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/write")
        .set_json(json!({ "pin": 5, "action": "pulse", "duration": 1, "loops": 3 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let highs = driver
        .writes(5)
        .into_iter()
        .filter(|l| *l == Level::High)
        .count();
    assert_eq!(highs, 3);
    assert_eq!(driver.output_level(5), Some(Level::Low));

    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["pins"]["5"]["value"], 0);
}

#[actix_rt::test]
async fn pwm_lifecycle() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 18, "action": "start", "frequency": 500, "duty_cycle": 25 }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 18, "action": "update", "duty_cycle": 75 }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    let pwm = &resp["pins"]["18"]["pwm"];
    assert_eq!(pwm["active"], true);
    assert_eq!(pwm["frequency"], 500.0);
    assert_eq!(pwm["duty_cycle"], 75.0);
    assert_eq!(resp["pins"]["18"]["mode"], "unconfigured");

    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 18, "action": "stop" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert!(resp["pins"]["18"].get("pwm").is_none());

    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 18, "action": "update", "duty_cycle": 10 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "PWM not active on pin 18");
}

#[actix_rt::test]
async fn pwm_rejects_out_of_range_duty() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 18, "action": "start", "duty_cycle": 101 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Duty cycle must be 0-100%");
}

#[actix_rt::test]
async fn monitor_requires_input() {
    let (state, scope_path) = sample_state(Arc::new(MockPinDriver::default()));

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 4, "mode": "output" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/monitor")
        .set_json(json!({ "pin": 4, "enable": true }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/mode")
        .set_json(json!({ "pin": 17, "mode": "input", "pull": "up" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/monitor")
        .set_json(json!({ "pin": 17 }))
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["monitoring"], true);

    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["pins"]["17"]["monitoring"], true);
    assert_eq!(resp["pins"]["17"]["pull"], "up");
    assert_eq!(resp["pins"]["17"]["value"], 1);
}

#[actix_rt::test]
async fn reset_unconfigures_everything() {
    let driver = Arc::new(MockPinDriver::default());
    let (state, scope_path) = sample_state(driver.clone());

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    for payload in [
        json!({ "pin": 4, "mode": "output" }),
        json!({ "pin": 17, "mode": "input" }),
    ] {
        let req = test::TestRequest::post()
            .uri("/api/mode")
            .set_json(payload)
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }
    let req = test::TestRequest::post()
        .uri("/api/pwm")
        .set_json(json!({ "pin": 12, "action": "start" }))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post().uri("/api/reset").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["success"], true);

    let req = test::TestRequest::get().uri("/api/pins").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    for (_, pin) in resp["pins"].as_object().unwrap() {
        assert_eq!(pin["mode"], "unconfigured");
        assert!(pin.get("pwm").is_none());
    }
    assert_eq!(driver.live_lines(), 0);
    assert_eq!(driver.live_pwms(), 0);
}
