//! Build rooftop and address PV registries for one city.
//!
//! Usage :
//!   cargo run --release -- Essen_PV_db.csv Essen_rooftops.geojson
//!   cargo run --release -- det.csv roofs.geojson --config pipeline.toml --geocode --csv addr.csv
//!
//! Produit :
//!   rooftop_registry.geojson — RoofTopID, areaInter, areaTilted, capacities, address
//!   address_registry.geojson — one point (or null geometry) per street address

use anyhow::{Context, Result};
use clap::Parser;
use pvregistry::{
    create_registries,
    geocode::{Geocoder, NominatimGeocoder, Throttled},
    io, PipelineParams, PipelineStats,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(
    name = "pvregistry",
    about = "Reconcile PV detections with cadastral rooftops into capacity registries",
    after_help = "Log level: RUST_LOG (default pvregistry=info)"
)]
struct Cli {
    /// Detections: tileId;imageCellOriginWKT;polygonWKT (WGS84, no header)
    #[arg(value_name = "DETECTIONS.csv")]
    detections: PathBuf,

    /// Rooftops: GeoJSON FeatureCollection (WGS84)
    #[arg(value_name = "ROOFTOPS.geojson")]
    rooftops: PathBuf,

    /// TOML file with pipeline parameters; flags below override it
    #[arg(long, value_name = "pipeline.toml", env = "PVREGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Buffer applied to detections before dissolving (m)
    #[arg(long)]
    buffer: Option<f64>,

    /// Minimum overhang area kept (m²)
    #[arg(long)]
    min_overhang: Option<f64>,

    /// Summed intersect share above which an installation is corrected
    #[arg(long)]
    anomaly_threshold: Option<f64>,

    /// Module area per kWp (m²)
    #[arg(long)]
    sqm_per_kwp: Option<f64>,

    /// Rooftop registry output
    #[arg(long, default_value = "rooftop_registry.geojson")]
    rooftop_out: PathBuf,

    /// Address registry output
    #[arg(long, default_value = "address_registry.geojson")]
    address_out: PathBuf,

    /// Also write the corrected fragment table as GeoJSON
    #[arg(long, value_name = "fragments.geojson")]
    fragments: Option<PathBuf>,

    /// Also export the address registry as CSV
    #[arg(long, value_name = "addresses.csv")]
    csv: Option<PathBuf>,

    /// Also export the rooftop registry as CSV with WKT outlines
    #[arg(long, value_name = "rooftops.csv")]
    rooftop_csv: Option<PathBuf>,

    /// Geocode street addresses
    #[arg(long)]
    geocode: bool,

    /// Nominatim base URL
    #[arg(long, env = "PVREGISTRY_GEOCODE_URL", default_value = NominatimGeocoder::PUBLIC_URL)]
    geocode_url: String,
}

impl Cli {
    fn params(&self) -> Result<PipelineParams> {
        let mut params = match &self.config {
            Some(path) => PipelineParams::from_toml_file(path)?,
            None => PipelineParams::default(),
        };
        if let Some(v) = self.buffer {
            params.buffer_m = v;
        }
        if let Some(v) = self.min_overhang {
            params.min_overhang_area_sqm = v;
        }
        if let Some(v) = self.anomaly_threshold {
            params.anomaly_threshold = v;
        }
        if let Some(v) = self.sqm_per_kwp {
            anyhow::ensure!(v > 0.0, "--sqm-per-kwp must be positive, got {}", v);
            params.sqm_per_kwp = v;
        }
        Ok(params)
    }
}

fn print_summary(stats: &PipelineStats) {
    println!("   Détections         : {}", stats.detections);
    println!("   Toits              : {}", stats.rooftops);
    println!("   Installations      : {}", stats.installations);
    println!("   Intersections      : {}", stats.intersections);
    println!(
        "   Débords            : {} restes, {} isolés, {} sauvés ({} via une autre installation)",
        stats.overhangs.remainders,
        stats.overhangs.free_standing,
        stats.overhangs.rescued,
        stats.rescued_cross_installation
    );
    println!(
        "   Anomalies          : {} installations, {} lignes retirées",
        stats.anomalies.flagged.len(),
        stats.anomalies.dropped_partial + stats.anomalies.dropped_duplicates
    );
    println!("   Fragments retenus  : {}", stats.fragments);
    if stats.geocoded + stats.geocode_failed > 0 {
        println!(
            "   Géocodage          : {} ok, {} échecs",
            stats.geocoded, stats.geocode_failed
        );
    }
}

// ==========================================================================
// Main
// ==========================================================================

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pvregistry=info")))
        .init();

    let cli = Cli::parse();
    let params = cli.params()?;

    println!("══════════════════════════════════════════════════════════");
    println!("  pvregistry — registre PV par toit et par adresse");
    println!("══════════════════════════════════════════════════════════\n");

    println!("1. Chargement...");
    let detections = io::read_detections(&cli.detections)?;
    let rooftops = io::read_rooftops(&cli.rooftops)?;
    println!(
        "   {} détections, {} toits",
        detections.len(),
        rooftops.len()
    );

    println!("2. Paramètres :");
    println!(
        "   buffer={:.2}m  débord min={:.1}m²  anomalie>{:.2}  {:.1}m²/kWp",
        params.buffer_m, params.min_overhang_area_sqm, params.anomaly_threshold, params.sqm_per_kwp
    );

    let geocoder = if cli.geocode {
        let client = NominatimGeocoder::new(&cli.geocode_url)
            .with_context(|| format!("cannot set up geocoder for '{}'", cli.geocode_url))?;
        info!(url = %cli.geocode_url, rate = params.geocode_rate_per_sec, "geocoding enabled");
        println!("   géocodage : {}", cli.geocode_url);
        Some(Throttled::new(client, params.geocode_rate_per_sec))
    } else {
        None
    };
    println!();

    println!("3. Rapprochement en cours...");
    let t0 = std::time::Instant::now();
    let out = create_registries(
        &detections,
        &rooftops,
        &params,
        geocoder.as_ref().map(|g| g as &dyn Geocoder),
    );
    println!("   ✓ terminé en {:.2}s\n", t0.elapsed().as_secs_f64());

    println!("4. Statistiques :");
    print_summary(&out.stats);
    let capacity: f64 = out.rooftops.iter().map(|r| r.capacity_tilted_kwp).sum();
    println!("   Puissance totale   : {:.1} kWp", capacity);

    println!("\n5. Export");
    io::write_rooftop_registry(&cli.rooftop_out, &out.rooftops, &out.projection)?;
    println!("   {} toits → '{}'", out.rooftops.len(), cli.rooftop_out.display());
    io::write_address_registry(&cli.address_out, &out.addresses)?;
    println!("   {} adresses → '{}'", out.addresses.len(), cli.address_out.display());
    if let Some(path) = &cli.fragments {
        io::write_fragments(path, &out.fragments, &out.projection)?;
        println!("   {} fragments → '{}'", out.fragments.len(), path.display());
    }
    if let Some(path) = &cli.csv {
        io::export_address_csv(path, &out.addresses)?;
        println!("   CSV adresses → '{}'", path.display());
    }
    if let Some(path) = &cli.rooftop_csv {
        io::export_rooftop_csv(path, &out.rooftops, &out.projection)?;
        println!("   CSV toits → '{}'", path.display());
    }

    println!("\n══════════════════════════════════════════════════════════");
    println!(
        "  ✓ Terminé — {} toits, {} adresses, {:.1} kWp",
        out.rooftops.len(),
        out.addresses.len(),
        capacity
    );
    println!("══════════════════════════════════════════════════════════");
    Ok(())
}
