mod cli;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use cli::{Cli, Command};
use visual_matcher::fetch::is_remote;
use visual_matcher::logging::{self, LogFormat};
use visual_matcher::{
    ArtifactPaths, Catalog, EmbeddingBuilder, ExtractorConfig, FeatureExtractor, ImageFetcher,
    ImageSource, MatcherConfig, MatcherError, SearchResponse, SearchService, server,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_env(), "info");

    match cli.command {
        Command::Build {
            catalog,
            out,
            image_root,
            model,
            jobs,
            no_progress,
            config,
        } => {
            let mut config = MatcherConfig::resolve(config.as_deref())?;
            if let Some(model) = model {
                config.extractor.model_path = model;
            }
            config.validate()?;

            let out = out.unwrap_or_else(|| config.artifacts_dir.clone());
            let image_root = image_root.unwrap_or_else(|| parent_dir(&catalog));
            let extractor = load_extractor(&config.extractor)?;
            let builder = EmbeddingBuilder::new(extractor, image_root)
                .with_fetcher(ImageFetcher::new(config.fetch.clone())?)
                .with_jobs(jobs)
                .with_progress(!no_progress && std::io::stderr().is_terminal());

            let report = builder.run(&catalog, &ArtifactPaths::in_dir(&out))?;
            println!(
                "Embedded {} of {} products into {} ({} skipped)",
                report.embedded,
                report.total,
                out.display(),
                report.skipped.len()
            );
            Ok(())
        }

        Command::Serve {
            port,
            bind,
            artifacts,
            model,
            allowed_origin,
            static_root,
            top_k,
            workers,
            config,
        } => {
            let mut config = MatcherConfig::resolve(config.as_deref())?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(dir) = artifacts {
                config.artifacts_dir = dir;
            }
            if let Some(model) = model {
                config.extractor.model_path = model;
            }
            if let Some(origin) = allowed_origin {
                config.server.allowed_origin = Some(origin);
            }
            if let Some(root) = static_root {
                config.server.static_root = Some(root);
            }
            if let Some(top_k) = top_k {
                config.top_k = top_k;
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            config.validate()?;

            let service = load_service(&config)?;
            let handle = server::start(&config.listen_addr(), Arc::new(service), config.server.clone())?;
            handle.wait();
            Ok(())
        }

        Command::Query {
            image,
            top_k,
            artifacts,
            model,
            config,
        } => {
            let mut config = MatcherConfig::resolve(config.as_deref())?;
            if let Some(dir) = artifacts {
                config.artifacts_dir = dir;
            }
            if let Some(model) = model {
                config.extractor.model_path = model;
            }
            config.validate()?;

            let service = load_service(&config)?;
            let source = if is_remote(&image) {
                ImageSource::Url(image)
            } else {
                let bytes = std::fs::read(&image).map_err(|source| MatcherError::Io {
                    source,
                    path: Some(PathBuf::from(&image)),
                })?;
                ImageSource::Upload(bytes)
            };
            let results = service.search(source, top_k)?;
            println!("{}", serde_json::to_string_pretty(&SearchResponse { results })?);
            Ok(())
        }
    }
}

/// Everything the service needs, loaded once. Any failure here is fatal.
fn load_service(config: &MatcherConfig) -> Result<SearchService, MatcherError> {
    let extractor = load_extractor(&config.extractor)?;
    let catalog = Catalog::load_for_model(&config.artifact_paths(), extractor.model())?;
    tracing::info!(
        rows = catalog.len(),
        dims = catalog.dimension(),
        model = %catalog.model(),
        "catalog loaded"
    );
    let fetcher = ImageFetcher::new(config.fetch.clone())?;
    SearchService::new(extractor, catalog, fetcher, config.top_k)
}

#[cfg(feature = "onnx")]
fn load_extractor(config: &ExtractorConfig) -> Result<Arc<dyn FeatureExtractor>, MatcherError> {
    Ok(Arc::new(visual_matcher::OnnxExtractor::load(config)?))
}

#[cfg(not(feature = "onnx"))]
fn load_extractor(_config: &ExtractorConfig) -> Result<Arc<dyn FeatureExtractor>, MatcherError> {
    Err(MatcherError::Config {
        reason: "this binary was built without the `onnx` feature".into(),
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
