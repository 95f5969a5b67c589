mod common;

use std::sync::Arc;
use std::thread;

use common::{BLUE, GREEN, GridColor, RED, png_bytes, split_image, write_png};
use reqwest::blocking::{Client, multipart};
use serde_json::Value;
use tempfile::TempDir;
use visual_matcher::server::{self, LIVENESS_TEXT};
use visual_matcher::{
    Catalog, FeatureExtractor, FetchPolicy, ImageFetcher, Product, SearchService, ServerHandle,
    ServerOptions,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const FRONTEND: &str = "https://frontend.example";

struct Harness {
    handle: ServerHandle,
    extractor: Arc<GridColor>,
    base: String,
    client: Client,
    static_root: TempDir,
}

impl Harness {
    fn start() -> Self {
        let extractor = Arc::new(GridColor::default());
        let static_root = tempfile::tempdir().expect("tempdir");

        let indexer = GridColor::default();
        let mut catalog = Catalog::new(indexer.model(), indexer.dimension());
        let images = [
            (1, "Red tee", split_image(RED, RED)),
            (2, "Blue-green tee", split_image(BLUE, GREEN)),
            (3, "Blue-red tee", split_image(BLUE, RED)),
        ];
        for (id, name, image) in images {
            let rel = format!("static/images/{id}.png");
            write_png(&static_root.path().join(&rel), &image);
            let embedding = indexer
                .extract_bytes(&png_bytes(&image))
                .expect("embed catalog image");
            catalog
                .push(Product::new(id, name, "Tops", rel), embedding)
                .expect("push");
        }
        std::fs::write(static_root.path().join("valid_products.json"), "[]").expect("write");

        let fetcher = ImageFetcher::new(FetchPolicy::default()).expect("fetcher");
        let service = SearchService::new(extractor.clone(), catalog, fetcher, 5).expect("service");
        let options = ServerOptions {
            allowed_origin: Some(FRONTEND.to_string()),
            static_root: Some(static_root.path().to_path_buf()),
            workers: 2,
            ..ServerOptions::default()
        };
        let handle = server::start("127.0.0.1:0", Arc::new(service), options).expect("start server");
        let base = format!("http://{}", handle.local_addr());

        Self {
            handle,
            extractor,
            base,
            client: Client::new(),
            static_root,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn upload(&self, path: &str, bytes: Vec<u8>) -> reqwest::blocking::Response {
        let form = multipart::Form::new().part("file", multipart::Part::bytes(bytes).file_name("query.png"));
        self.client
            .post(self.url(path))
            .multipart(form)
            .send()
            .expect("send upload")
    }

    fn stop(self) {
        self.handle.shutdown();
    }
}

#[test]
fn liveness_is_plain_text() -> TestResult {
    let h = Harness::start();
    let resp = h.client.get(h.url("/")).send()?;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text()?, LIVENESS_TEXT);
    h.stop();
    Ok(())
}

#[test]
fn missing_image_is_400_without_extraction() -> TestResult {
    let h = Harness::start();

    let resp = h.client.post(h.url("/api/search")).json(&serde_json::json!({})).send()?;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json()?;
    assert_eq!(body["error"], "No image provided");
    assert_eq!(body["kind"], "missing_input");

    let resp = h.client.post(h.url("/api/search")).send()?;
    assert_eq!(resp.status().as_u16(), 400);

    let form = multipart::Form::new().text("note", "no file here");
    let resp = h.client.post(h.url("/api/search")).multipart(form).send()?;
    assert_eq!(resp.status().as_u16(), 400);

    assert_eq!(h.extractor.calls(), 0);
    h.stop();
    Ok(())
}

#[test]
fn upload_returns_ranked_results() -> TestResult {
    let h = Harness::start();
    let resp = h.upload("/api/search", png_bytes(&split_image(BLUE, GREEN)));
    assert_eq!(resp.status().as_u16(), 200);

    let body: Value = resp.json()?;
    let results = body["results"].as_array().expect("results array");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["id"], 2);
    assert_eq!(results[0]["similarity"], 1.0);
    assert_eq!(results[1]["id"], 3);
    assert_eq!(results[0]["image"], "static/images/2.png");
    let scores: Vec<f64> = results.iter().filter_map(|r| r["similarity"].as_f64()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));

    let resp = h.upload("/api/search?top_k=1", png_bytes(&split_image(RED, RED)));
    let body: Value = resp.json()?;
    assert_eq!(body["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["results"][0]["id"], 1);
    h.stop();
    Ok(())
}

#[test]
fn malformed_upload_is_500_and_service_survives() -> TestResult {
    let h = Harness::start();
    let resp = h.upload("/api/search", b"this is not an image".to_vec());
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json()?;
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    assert_eq!(body["kind"], "image_decode");

    assert_eq!(h.client.get(h.url("/")).send()?.status().as_u16(), 200);
    h.stop();
    Ok(())
}

#[test]
fn image_url_is_fetched_and_searched() -> TestResult {
    let h = Harness::start();

    let origin = tiny_http::Server::http("127.0.0.1:0").map_err(|e| e.to_string())?;
    let origin_addr = origin.server_addr().to_ip().expect("ip addr");
    let image = png_bytes(&split_image(BLUE, RED));
    thread::spawn(move || {
        if let Ok(request) = origin.recv() {
            let _ = request.respond(tiny_http::Response::from_data(image));
        }
    });

    let resp = h
        .client
        .post(h.url("/api/search"))
        .json(&serde_json::json!({
            "image_url": format!("http://{origin_addr}/c.png"),
            "top_k": 2
        }))
        .send()?;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json()?;
    assert_eq!(body["results"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["results"][0]["id"], 3);
    h.stop();
    Ok(())
}

#[test]
fn bad_requests_are_400() -> TestResult {
    let h = Harness::start();

    let resp = h
        .client
        .post(h.url("/api/search"))
        .json(&serde_json::json!({"image_url": "ftp://example.com/a.png"}))
        .send()?;
    assert_eq!(resp.status().as_u16(), 400);

    let resp = h
        .client
        .post(h.url("/api/search"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()?;
    assert_eq!(resp.status().as_u16(), 400);

    let resp = h.upload("/api/search?top_k=0", png_bytes(&split_image(RED, RED)));
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(h.extractor.calls(), 0);
    h.stop();
    Ok(())
}

#[test]
fn cors_is_limited_to_the_configured_origin() -> TestResult {
    let h = Harness::start();

    let resp = h.client.get(h.url("/")).header("Origin", FRONTEND).send()?;
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some(FRONTEND)
    );

    let resp = h.client.get(h.url("/")).header("Origin", "https://other.example").send()?;
    assert!(resp.headers().get("access-control-allow-origin").is_none());

    let resp = h
        .client
        .request(reqwest::Method::OPTIONS, h.url("/api/search"))
        .header("Origin", FRONTEND)
        .header("Access-Control-Request-Method", "POST")
        .send()?;
    assert_eq!(resp.status().as_u16(), 204);
    assert!(resp.headers().get("access-control-allow-methods").is_some());
    assert!(resp.headers().get("access-control-allow-origin").is_some());
    h.stop();
    Ok(())
}

#[test]
fn preflight_is_only_answered_for_search() -> TestResult {
    let h = Harness::start();

    for path in ["/does/not/exist", "/"] {
        let resp = h
            .client
            .request(reqwest::Method::OPTIONS, h.url(path))
            .header("Origin", "https://other.example")
            .header("Access-Control-Request-Method", "POST")
            .send()?;
        assert_eq!(resp.status().as_u16(), 404, "OPTIONS {path}");
        assert!(resp.headers().get("access-control-allow-methods").is_none());
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }
    h.stop();
    Ok(())
}

#[test]
fn catalog_images_are_served_statically() -> TestResult {
    let h = Harness::start();

    let resp = h.client.get(h.url("/static/images/2.png")).send()?;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("image/png")
    );
    let on_disk = std::fs::read(h.static_root.path().join("static/images/2.png"))?;
    assert_eq!(resp.bytes()?.as_ref(), on_disk.as_slice());

    assert_eq!(h.client.get(h.url("/static/images/9.png")).send()?.status().as_u16(), 404);
    assert_eq!(h.client.get(h.url("/valid_products.json")).send()?.status().as_u16(), 404);
    h.stop();
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> TestResult {
    let h = Harness::start();
    assert_eq!(h.client.get(h.url("/api/search")).send()?.status().as_u16(), 405);
    assert_eq!(h.client.post(h.url("/api/other")).send()?.status().as_u16(), 404);
    h.stop();
    Ok(())
}
