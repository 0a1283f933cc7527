use std::fs::{self, File};
use std::io::{self, Write};
use std::panic;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use ndarray::Array2;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use qubic_iv::{
    normal_resistance, pps2date, pulse_diagnostics, timeline2adu, to_utc, AnalysisConfig,
    BiasSweep, ChannelId, FitKind, IvDataset, TimelineParams, Verdict, DEFAULT_PPS_EPSILON,
};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "QUBIC TES I-V analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit and grade every channel of an I-V acquisition (`bias,<ch1>,<ch2>,...`)
    Iv(IvArgs),
    /// Remap a timeline acquisition onto its modeled bias, then grade it
    Timeline(TimelineArgs),
    /// Reconstruct sample timestamps from `pps,date` columns
    Timestamps(TimestampsArgs),
}

#[derive(Parser, Debug)]
struct IvArgs {
    /// CSV with a bias column followed by one column per channel
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Number of bias cycles (detected from the bias column when omitted)
    #[arg(long)]
    cycles: Option<usize>,

    #[command(flatten)]
    analysis: AnalysisArgs,
}

#[derive(Parser, Debug)]
struct TimelineArgs {
    /// CSV with one column per channel, one row per time sample
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Channel (1-based) whose trace locates the bias maxima
    #[arg(long, default_value_t = 1)]
    reference: usize,

    /// Bias modulation period (seconds)
    #[arg(long)]
    bias_period: f64,

    /// Sample period (seconds)
    #[arg(long)]
    sample_period: f64,

    #[arg(long)]
    min_bias: f64,

    #[arg(long)]
    max_bias: f64,

    /// Phase correction in bias periods
    #[arg(long, default_value_t = 0.0)]
    shift: f64,

    /// Initial span ignored by the peak search (seconds)
    #[arg(long, default_value_t = 3.0)]
    skip: f64,

    #[command(flatten)]
    analysis: AnalysisArgs,
}

#[derive(Args, Debug)]
struct AnalysisArgs {
    /// JSON analysis config; flags below override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Fit model
    #[arg(long, value_enum)]
    fit: Option<FitKindOpt>,

    /// Jump filter threshold in units of the mean relative step
    #[arg(long)]
    jump_threshold: Option<f64>,

    /// Fit this cycle instead of the best-residual one
    #[arg(long)]
    cycle: Option<usize>,

    #[arg(long)]
    residual_limit: Option<f64>,

    #[arg(long)]
    abs_amplitude_limit: Option<f64>,

    #[arg(long)]
    rel_amplitude_limit: Option<f64>,

    #[arg(long)]
    bias_margin: Option<f64>,

    /// Samples are raw ADU; convert to µA with the readout calibration
    #[arg(long, action = ArgAction::SetTrue)]
    adu: bool,

    /// Per-channel verdict CSV (`-` for stdout)
    #[arg(short, long, default_value = "iv_verdicts.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON summary with the parameters hash
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Offset-adjusted I-V, P-V and R-V curves of the good channels (`-` for stdout)
    #[arg(long, value_hint = ValueHint::FilePath)]
    curves: Option<PathBuf>,

    /// PNG plot of the good channels with their fits
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// SVG plot of the good channels with their fits
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct TimestampsArgs {
    /// CSV with `pps` and `date` columns
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "timestamps.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Tolerance around the one-second pulse separation
    #[arg(long, default_value_t = DEFAULT_PPS_EPSILON)]
    epsilon: f64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FitKindOpt {
    Polynomial,
    Combined,
}

impl From<FitKindOpt> for FitKind {
    fn from(value: FitKindOpt) -> Self {
        match value {
            FitKindOpt::Polynomial => FitKind::Polynomial,
            FitKindOpt::Combined => FitKind::Combined,
        }
    }
}

impl AnalysisArgs {
    fn resolve_config(&self) -> Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        if let Some(kind) = self.fit {
            config.fit_kind = kind.into();
        }
        if self.jump_threshold.is_some() {
            config.jump_threshold = self.jump_threshold;
        }
        if self.cycle.is_some() {
            config.forced_cycle_index = self.cycle;
        }
        if let Some(v) = self.residual_limit {
            config.thresholds.residual_limit = v;
        }
        if let Some(v) = self.abs_amplitude_limit {
            config.thresholds.abs_amplitude_limit = v;
        }
        if let Some(v) = self.rel_amplitude_limit {
            config.thresholds.rel_amplitude_limit = v;
        }
        if let Some(v) = self.bias_margin {
            config.thresholds.bias_margin = v;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Iv(args) => args.analysis.verbose,
        Command::Timeline(args) => args.analysis.verbose,
        Command::Timestamps(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Iv(args) => handle_iv(args),
        Command::Timeline(args) => handle_timeline(args),
        Command::Timestamps(args) => handle_timestamps(args),
    }
}

fn handle_iv(args: IvArgs) -> Result<()> {
    let config = args.analysis.resolve_config()?;
    let table = read_numeric_csv(&args.input)?;
    if table.headers.len() < 2 {
        return Err(anyhow!(
            "{} needs a bias column and at least one channel column",
            args.input.display()
        ));
    }

    let bias: Vec<f64> = table.rows.iter().map(|row| row[0]).collect();
    let sweep = match args.cycles {
        Some(cycles) => BiasSweep::from_values(bias, cycles),
        None => BiasSweep::detect(bias),
    };
    info!(
        samples = sweep.len(),
        cycles = sweep.cycle_count(),
        channels = table.headers.len() - 1,
        "loaded I-V acquisition"
    );

    let samples = table.channel_matrix(1);
    let samples = if args.analysis.adu {
        config.readout.convert_matrix(&samples)
    } else {
        samples
    };
    let dataset = IvDataset::new(sweep, samples)
        .with_context(|| format!("invalid acquisition in {}", args.input.display()))?;
    run_analysis(dataset, &config, &args.analysis)
}

fn handle_timeline(args: TimelineArgs) -> Result<()> {
    let config = args.analysis.resolve_config()?;
    let table = read_numeric_csv(&args.input)?;
    let timeline = table.channel_matrix(0);
    let timeline = if args.analysis.adu {
        config.readout.convert_matrix(&timeline)
    } else {
        timeline
    };

    let params = TimelineParams {
        shift: args.shift,
        skip_s: args.skip,
        ..TimelineParams::new(
            args.bias_period,
            args.sample_period,
            args.min_bias,
            args.max_bias,
        )
    };
    let reference = ChannelId::new(args.reference).unwrap_or_else(|| {
        warn!(reference = args.reference, "channel numbers start at 1; using channel 1");
        ChannelId::from_index(0)
    });
    let remapped = timeline2adu(reference, &timeline, &params)
        .with_context(|| format!("failed to remap {}", args.input.display()))?;
    info!(
        peak0 = remapped.peaks.0,
        peak1 = remapped.peaks.1,
        cycles = remapped.cycles,
        "timeline remapped onto bias sweep"
    );

    let dataset = remapped.into_dataset()?;
    run_analysis(dataset, &config, &args.analysis)
}

fn handle_timestamps(args: TimestampsArgs) -> Result<()> {
    let table = read_numeric_csv(&args.input)?;
    let pps_col = table.column("pps")?;
    let date_col = table.column("date")?;
    let pulse: Vec<u8> = table
        .rows
        .iter()
        .map(|row| u8::from(row[pps_col] != 0.0))
        .collect();
    let date: Vec<f64> = table.rows.iter().map(|row| row[date_col]).collect();

    let diagnostics = pulse_diagnostics(&pulse, &date, args.epsilon);
    info!(
        pulses = diagnostics.events.len(),
        jumps = diagnostics.jumps.len(),
        sticks = diagnostics.sticks.len(),
        "pulse train inspected"
    );
    for &k in &diagnostics.jumps {
        warn!(
            index = diagnostics.events[k + 1].rising,
            separation = diagnostics.separations[k],
            "missed pulse"
        );
    }
    for &k in &diagnostics.sticks {
        warn!(
            index = diagnostics.events[k + 1].rising,
            separation = diagnostics.separations[k],
            "spurious pulse"
        );
    }

    let timestamps = pps2date(&pulse, &date);
    let rows = timestamps.iter().enumerate().map(|(idx, ts)| {
        [
            idx.to_string(),
            format!("{:.6}", ts),
            to_utc(*ts)
                .map(|utc| utc.to_rfc3339())
                .unwrap_or_default(),
        ]
    });
    write_csv(&args.output, ["index", "timestamp", "utc"], rows)?;
    info!(samples = timestamps.len(), output = %args.output.display(), "timestamps written");
    Ok(())
}

fn run_analysis(
    mut dataset: IvDataset,
    config: &AnalysisConfig,
    args: &AnalysisArgs,
) -> Result<()> {
    dataset.filter_all(config);
    let summary = dataset.summary();
    info!(
        good = summary.good_count,
        channels = summary.channel_count,
        median_turnover = ?summary.median_turnover,
        "analysis complete"
    );

    let rows: Vec<[String; 11]> = dataset
        .verdicts()
        .iter()
        .map(|(id, verdict)| verdict_row(*id, verdict, config))
        .collect();
    write_csv(
        &args.output,
        [
            "channel",
            "is_good",
            "reason",
            "fit_kind",
            "cycle",
            "residual",
            "turnover",
            "r1",
            "offset",
            "peak_to_peak",
            "normal_resistance",
        ],
        rows,
    )?;

    if let Some(path) = args.summary.as_ref() {
        let report = json!({
            "generated_at": Utc::now().to_rfc3339(),
            "params": config.params_json(),
            "params_hash": config.params_hash_sha256()?,
            "summary": summary,
        });
        let text = serde_json::to_string_pretty(&report)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    }

    if let Some(path) = args.curves.as_ref() {
        write_curves(&dataset, config, path)?;
    }

    let series = collect_plot_series(&dataset);
    for (path, kind) in [
        (args.png.as_ref(), ChartKind::Png),
        (args.svg.as_ref(), ChartKind::Svg),
    ] {
        let Some(path) = path else { continue };
        if series.is_empty() {
            warn!(path = %path.display(), "no good channels to plot");
            continue;
        }
        if let Err(err) = render_chart_guard(&series, path, kind) {
            warn!(path = %path.display(), "failed to render chart: {}", err);
        }
    }
    Ok(())
}

fn write_curves(dataset: &IvDataset, config: &AnalysisConfig, path: &Path) -> Result<()> {
    let mut rows = Vec::new();
    for id in dataset.channels() {
        if !dataset.verdict(id).is_some_and(|v| v.is_good) {
            continue;
        }
        let Some(curve) = dataset.tes_curve(id, &config.readout)? else {
            continue;
        };
        for k in 0..curve.bias.len() {
            rows.push([
                id.to_string(),
                format!("{:.6}", curve.bias[k]),
                format!("{:.6}", curve.current[k]),
                format!("{:.6}", curve.voltage[k]),
                format!("{:.6}", curve.power[k]),
                format!("{:.6}", curve.resistance[k]),
            ]);
        }
    }
    write_csv(
        path,
        ["channel", "bias", "current", "voltage", "power", "resistance"],
        rows,
    )?;
    info!(output = %path.display(), "adjusted curves written");
    Ok(())
}

fn verdict_row(id: ChannelId, verdict: &Verdict, config: &AnalysisConfig) -> [String; 11] {
    let opt = |v: Option<f64>| v.map(|v| format!("{:.6}", v)).unwrap_or_default();
    let fit = &verdict.fit;
    [
        id.to_string(),
        verdict.is_good.to_string(),
        verdict.reason.to_string(),
        fit.kind.name().to_string(),
        fit.cycle_index.to_string(),
        format!("{:.6e}", fit.residual),
        opt(fit.turnover()),
        opt(fit.r1()),
        opt(fit.offset()),
        format!("{:.6}", verdict.peak_to_peak),
        opt(normal_resistance(verdict, &config.readout)),
    ]
}

fn write_csv<const N: usize, R>(path: &Path, header: [&str; N], rows: R) -> Result<()>
where
    R: IntoIterator<Item = [String; N]>,
{
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        return write_rows(&mut writer, header, rows);
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_rows(&mut writer, header, rows)
}

fn write_rows<W: Write, const N: usize, R>(
    writer: &mut csv::Writer<W>,
    header: [&str; N],
    rows: R,
) -> Result<()>
where
    R: IntoIterator<Item = [String; N]>,
{
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Headered CSV of numbers, row-major as read.
struct NumericTable {
    headers: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl NumericTable {
    fn column(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("missing column `{}`", name))
    }

    /// Columns from `first` onwards as a channels x samples matrix.
    fn channel_matrix(&self, first: usize) -> Array2<f64> {
        let channels = self.headers.len().saturating_sub(first);
        Array2::from_shape_fn((channels, self.rows.len()), |(ch, i)| self.rows[i][first + ch])
    }
}

fn read_numeric_csv(path: &Path) -> Result<NumericTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("{}: bad record {}", path.display(), line + 2))?;
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f64>().with_context(|| {
                    format!("{}: line {}: `{}` is not a number", path.display(), line + 2, field)
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        if row.len() != headers.len() {
            return Err(anyhow!(
                "{}: line {} has {} fields, header has {}",
                path.display(),
                line + 2,
                row.len(),
                headers.len()
            ));
        }
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(anyhow!("{} has no data rows", path.display()));
    }
    Ok(NumericTable { headers, rows })
}

#[derive(Clone, Debug)]
struct PlotSeries {
    label: String,
    points: Vec<(f64, f64)>,
    fit: Vec<(f64, f64)>,
}

enum ChartKind {
    Png,
    Svg,
}

const FIT_CURVE_POINTS: usize = 200;

fn collect_plot_series(dataset: &IvDataset) -> Vec<PlotSeries> {
    let bias = dataset.sweep().values();
    dataset
        .verdicts()
        .iter()
        .filter(|(_, verdict)| verdict.is_good)
        .filter_map(|(id, verdict)| {
            let samples = dataset.channel_samples(*id).ok()?;
            let (start, end) = verdict.fit.cycle_range;
            let points: Vec<(f64, f64)> = bias[start..end]
                .iter()
                .copied()
                .zip(samples[start..end].iter().copied())
                .collect();
            let lo = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
            let hi = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
            if hi <= lo {
                return None;
            }
            let step = (hi - lo) / (FIT_CURVE_POINTS - 1) as f64;
            let fit = (0..FIT_CURVE_POINTS)
                .map(|i| {
                    let v = lo + step * i as f64;
                    (v, verdict.fit.model.evaluate(v))
                })
                .collect();
            Some(PlotSeries {
                label: id.to_string(),
                points,
                fit,
            })
        })
        .collect()
}

fn render_chart_guard(series: &[PlotSeries], path: &Path, kind: ChartKind) -> Result<(), String> {
    let render = || -> Result<(), String> {
        let drawn = match kind {
            ChartKind::Png => {
                let root = BitMapBackend::new(path, (1280, 760)).into_drawing_area();
                draw_iv_chart(root, series)
            }
            ChartKind::Svg => {
                let root = SVGBackend::new(path, (1280, 760)).into_drawing_area();
                draw_iv_chart(root, series)
            }
        };
        drawn.map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn draw_iv_chart<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    series: &[PlotSeries],
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let all = series.iter().flat_map(|s| s.points.iter().chain(s.fit.iter()));
    let (mut x_min, mut x_max, mut y_min, mut y_max) = (
        f64::INFINITY,
        f64::NEG_INFINITY,
        f64::INFINITY,
        f64::NEG_INFINITY,
    );
    for &(x, y) in all {
        if x.is_finite() && y.is_finite() {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
        }
    }
    let pad = 0.05 * (y_max - y_min).max(f64::EPSILON);

    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(25)
        .caption("I-V curves of good channels", ("sans-serif", 24))
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 45)
        .build_cartesian_2d(x_min..x_max, (y_min - pad)..(y_max + pad))?;

    let axis_font = FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal);
    chart
        .configure_mesh()
        .x_desc("Bias (V)")
        .y_desc("Current")
        .x_label_formatter(&|v| format!("{:.2}", v))
        .y_label_formatter(&|v| format!("{:.3}", v))
        .label_style(axis_font.color(&BLACK.mix(0.85)))
        .draw()?;

    for (idx, s) in series.iter().enumerate() {
        let color = Palette99::pick(idx).to_rgba();
        chart
            .draw_series(
                s.points
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 2, color.mix(0.6).filled())),
            )?
            .label(s.label.as_str())
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, color.filled()));
        chart.draw_series(LineSeries::new(s.fit.iter().copied(), BLACK.mix(0.7)))?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;

    root.present()?;
    Ok(())
}
