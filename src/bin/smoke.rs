use clap::{Arg, Command};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::{process, time::Instant};
use uuid::Uuid;

#[derive(Debug)]
struct StepResult {
    success: bool,
}

struct SmokeRunner {
    client: Client,
    base_url: String,
    verbose: bool,
    results: Vec<StepResult>,
}

/// Ids and tokens threaded from one step to the next.
#[derive(Default)]
struct Walkthrough {
    host_id: String,
    host_token: String,
    driver_token: String,
    vehicle_id: String,
    reservation_id: String,
    intent_id: String,
    session_id: String,
}

impl SmokeRunner {
    fn new(base_url: String, verbose: bool) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url,
            verbose,
            results: Vec::new(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<(u16, Value), String> {
        let url = format!("{}{}", self.base_url, path);
        if self.verbose {
            println!("  → {} {}", method, url);
            if let Some(ref body) = body {
                println!("    Body: {}", body);
            }
        }

        let mut request = self.client.request(method, &url);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;

        if self.verbose {
            println!("    Status: {}", status);
            println!("    Response: {}", text);
        }

        if text.is_empty() {
            return Ok((status, Value::Null));
        }
        Ok((status, serde_json::from_str(&text).unwrap_or_else(|_| json!(text))))
    }

    /// Issues the request and fails unless the status matches.
    async fn expect_status(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
        expected: u16,
    ) -> Result<Value, String> {
        let (status, value) = self.request(method, path, token, body).await?;
        if status != expected {
            return Err(format!(
                "{} expected status {}, got {}: {}",
                path, expected, status, value
            ));
        }
        Ok(value)
    }

    fn record(&mut self, name: &str, started: Instant, outcome: Result<(), String>) {
        let duration_ms = started.elapsed().as_millis();
        let status = if outcome.is_ok() { "\x1b[32m✅" } else { "\x1b[31m❌" };
        println!(
            " {} {:.<45} \x1b[90m({:>3}ms)\x1b[0m",
            status,
            format!("{} ", name),
            duration_ms
        );
        if let Err(ref err) = outcome {
            println!("    \x1b[31m{}\x1b[0m", err);
        }
        self.results.push(StepResult {
            success: outcome.is_ok(),
        });
    }

    fn print_summary(&self) {
        let total = self.results.len();
        let passed = self.results.iter().filter(|r| r.success).count();
        let failed = total - passed;

        println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            println!("\x1b[32mResults: {}/{} passed\x1b[0m", passed, total);
        } else {
            println!(
                "\x1b[31mResults: {}/{} passed, {} failed\x1b[0m",
                passed, total, failed
            );
            process::exit(1);
        }
    }
}

fn field(value: &Value, pointer: &str) -> Result<String, String> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| format!("missing {} in {}", pointer, value))
}

async fn register_parties(runner: &SmokeRunner, w: &mut Walkthrough) -> Result<(), String> {
    let suffix = Uuid::new_v4().simple().to_string();
    let host = runner
        .expect_status(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"username": format!("smoke-host-{}", &suffix[..8])})),
            200,
        )
        .await?;
    let driver = runner
        .expect_status(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"username": format!("smoke-driver-{}", &suffix[..8])})),
            200,
        )
        .await?;
    w.host_id = field(&host, "/user_id")?;
    w.host_token = field(&host, "/token")?;
    w.driver_token = field(&driver, "/token")?;
    Ok(())
}

async fn list_vehicle(runner: &SmokeRunner, admin_key: &str, w: &mut Walkthrough) -> Result<(), String> {
    w.vehicle_id = Uuid::new_v4().to_string();
    runner
        .expect_status(
            Method::PUT,
            &format!("/vehicles/{}", w.vehicle_id),
            Some(admin_key),
            Some(json!({
                "host_id": w.host_id,
                "name": "Smoke test hatchback",
                "utc_offset_minutes": 0,
                "rate_card": {
                    "daily_rate_cents": 4000,
                    "weekly_rate_cents": 24000,
                    "insurance_per_day_cents": 500
                }
            })),
            200,
        )
        .await?;
    Ok(())
}

async fn book(runner: &SmokeRunner, w: &mut Walkthrough) -> Result<(), String> {
    let start = chrono::Utc::now().date_naive() + chrono::Duration::days(2);
    let created = runner
        .expect_status(
            Method::POST,
            "/reservations",
            Some(&w.driver_token),
            Some(json!({
                "vehicle_id": w.vehicle_id,
                "start_date": start.to_string(),
                "pickup_time": "09:30",
                "quantum": "daily",
                "quantity": 2,
                "insurance": true,
                "message": "Smoke test booking"
            })),
            201,
        )
        .await?;
    if created["price"]["total_cents"] != json!(9000) {
        return Err(format!("unexpected price: {}", created["price"]));
    }
    w.reservation_id = field(&created, "/id")?;

    // The same range must now be taken.
    let (status, _) = runner
        .request(
            Method::POST,
            "/reservations",
            Some(&w.driver_token),
            Some(json!({
                "vehicle_id": w.vehicle_id,
                "start_date": start.to_string(),
                "quantum": "daily",
                "quantity": 1
            })),
        )
        .await?;
    if status != 409 {
        return Err(format!("overlapping booking returned {}", status));
    }
    Ok(())
}

async fn confirm(runner: &SmokeRunner, w: &Walkthrough) -> Result<(), String> {
    let path = format!("/reservations/{}/confirm", w.reservation_id);
    let (status, _) = runner
        .request(Method::POST, &path, Some(&w.driver_token), None)
        .await?;
    if status != 403 {
        return Err(format!("driver confirm returned {}", status));
    }
    let confirmed = runner
        .expect_status(Method::POST, &path, Some(&w.host_token), None, 200)
        .await?;
    if confirmed["status"] != "confirmed" {
        return Err(format!("status after confirm: {}", confirmed["status"]));
    }
    Ok(())
}

async fn pay(runner: &SmokeRunner, w: &mut Walkthrough) -> Result<(), String> {
    let intent = runner
        .expect_status(
            Method::POST,
            &format!("/reservations/{}/payments", w.reservation_id),
            Some(&w.driver_token),
            None,
            200,
        )
        .await?;
    w.intent_id = field(&intent, "/intent_id")?;

    let receipt = runner
        .expect_status(
            Method::POST,
            &format!(
                "/reservations/{}/payments/{}/checkout",
                w.reservation_id, w.intent_id
            ),
            Some(&w.driver_token),
            Some(json!({"payment_method": "pm_card_visa"})),
            200,
        )
        .await?;
    if receipt["reservation"]["payment_status"] != "paid" {
        return Err(format!("receipt not paid: {}", receipt));
    }

    // Confirming the same intent again is a no-op.
    let again = runner
        .expect_status(
            Method::POST,
            &format!("/reservations/{}/payments/confirm", w.reservation_id),
            Some(&w.driver_token),
            Some(json!({"intent_id": w.intent_id})),
            200,
        )
        .await?;
    if again["outcome"] != "already_applied" {
        return Err(format!("second confirm outcome: {}", again["outcome"]));
    }
    Ok(())
}

async fn extend(runner: &SmokeRunner, w: &Walkthrough) -> Result<(), String> {
    let quote = runner
        .expect_status(
            Method::POST,
            &format!("/reservations/{}/extensions", w.reservation_id),
            Some(&w.driver_token),
            Some(json!({"quantity": 1, "dropoff_time": "18:00"})),
            201,
        )
        .await?;
    let intent_id = field(&quote, "/intent/intent_id")?;
    let receipt = runner
        .expect_status(
            Method::POST,
            &format!(
                "/reservations/{}/payments/{}/checkout",
                w.reservation_id, intent_id
            ),
            Some(&w.driver_token),
            Some(json!({"payment_method": "pm_card_visa"})),
            200,
        )
        .await?;
    if receipt["outcome"] != "extension_applied" {
        return Err(format!("extension outcome: {}", receipt["outcome"]));
    }
    let reconciled = runner
        .expect_status(
            Method::POST,
            &format!("/reservations/{}/payments/reconcile", w.reservation_id),
            Some(&w.host_token),
            None,
            200,
        )
        .await?;
    if reconciled["outcome"] != "already_paid" {
        return Err(format!("reconcile outcome: {}", reconciled["outcome"]));
    }
    Ok(())
}

async fn host_cancel(runner: &SmokeRunner, w: &Walkthrough) -> Result<(), String> {
    let report = runner
        .expect_status(
            Method::POST,
            &format!("/reservations/{}/host-cancel", w.reservation_id),
            Some(&w.host_token),
            Some(json!({"reason": "smoke test cleanup"})),
            200,
        )
        .await?;
    if report["reservation"]["status"] != "cancelled" {
        return Err(format!("host cancel left {}", report["reservation"]["status"]));
    }
    if report["refund_pending"] == json!(true) {
        return Err("refund is still pending".to_string());
    }
    Ok(())
}

async fn relay(runner: &SmokeRunner, w: &mut Walkthrough) -> Result<(), String> {
    let session = runner
        .expect_status(
            Method::POST,
            "/relay/sessions",
            None,
            Some(json!({"label": "licence-front"})),
            201,
        )
        .await?;
    w.session_id = field(&session, "/session_id")?;
    let path = format!("/relay/sessions/{}", w.session_id);

    for n in 1..=2 {
        runner
            .expect_status(
                Method::POST,
                &format!("{}/images", path),
                None,
                Some(json!({"image_ref": format!("https://files.example.com/smoke/{}.jpg", n)})),
                200,
            )
            .await?;
    }

    let polled = runner
        .expect_status(Method::GET, &format!("{}?since=1", path), None, None, 200)
        .await?;
    if polled["count"] != json!(2) || polled["images"].as_array().map(Vec::len) != Some(1) {
        return Err(format!("unexpected poll: {}", polled));
    }

    runner
        .expect_status(Method::DELETE, &path, None, None, 204)
        .await?;
    let (status, _) = runner.request(Method::GET, &path, None, None).await?;
    if status != 404 {
        return Err(format!("closed session returned {}", status));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Command::new("rufs-smoke")
        .about("End-to-end walkthrough against a running rufs server")
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("URL")
                .help("Base URL to test against")
                .default_value("http://127.0.0.1:3000"),
        )
        .arg(
            Arg::new("admin-key")
                .long("admin-key")
                .value_name("KEY")
                .help("ADMIN_KEY of the server, used to list a vehicle")
                .required(true),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .help("Print detailed request/response info")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let base_url = matches
        .get_one::<String>("url")
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_default();
    let admin_key = matches
        .get_one::<String>("admin-key")
        .cloned()
        .unwrap_or_default();
    let verbose = matches.get_flag("verbose");

    println!("\x1b[1m🚗 rufs smoke test\x1b[0m");
    println!("\x1b[90m   Target: {}\x1b[0m\n", base_url);

    let mut runner = match SmokeRunner::new(base_url, verbose) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };
    let mut w = Walkthrough::default();

    let started = Instant::now();
    let outcome = runner
        .expect_status(Method::GET, "/health", None, None, 200)
        .await
        .map(|_| ());
    runner.record("Health check", started, outcome);

    let started = Instant::now();
    let outcome = register_parties(&runner, &mut w).await;
    let registered = outcome.is_ok();
    runner.record("Register host and driver", started, outcome);

    if registered {
        let started = Instant::now();
        let outcome = list_vehicle(&runner, &admin_key, &mut w).await;
        runner.record("List a vehicle", started, outcome);

        let started = Instant::now();
        let outcome = book(&runner, &mut w).await;
        let booked = outcome.is_ok();
        runner.record("Book and reject overlap", started, outcome);

        if booked {
            let started = Instant::now();
            let outcome = confirm(&runner, &w).await;
            runner.record("Host confirms", started, outcome);

            let started = Instant::now();
            let outcome = pay(&runner, &mut w).await;
            runner.record("Pay and re-confirm", started, outcome);

            let started = Instant::now();
            let outcome = extend(&runner, &w).await;
            runner.record("Extend by one day", started, outcome);

            let started = Instant::now();
            let outcome = host_cancel(&runner, &w).await;
            runner.record("Host cancel with refund", started, outcome);
        }
    }

    let started = Instant::now();
    let outcome = relay(&runner, &mut w).await;
    runner.record("Upload relay round trip", started, outcome);

    runner.print_summary();
}
