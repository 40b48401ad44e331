//! daestep command-line interface.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use daestep_core::NodeId;
use daestep_devices::{BoxedDevice, DeviceRegistry, DeviceSpec, Waveform};
use daestep_solver::{
    register_nested_devices, IntegrationStatus, Integrator, IntegratorOptions, Loader,
};

#[derive(Parser)]
#[command(name = "daestep")]
#[command(about = "Variable-order BDF transient solver for circuit DAEs", long_about = None)]
#[command(version)]
struct Cli {
    /// Built-in circuit to simulate
    #[arg(long, value_enum, default_value = "rc")]
    circuit: Circuit,

    /// Final time (s); defaults to a few time constants of the circuit
    #[arg(long)]
    tstop: Option<f64>,

    /// JSON file overriding integrator options
    #[arg(long, value_name = "JSON")]
    options: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Circuit {
    /// 1k / 1uF low-pass driven by a 1 V step at 1 ms
    Rc,
    /// 50 Hz half-wave rectifier with a series-resistance diode
    Rectifier,
    /// RC low-pass driven by a periodic pulse
    PulseRc,
}

impl Circuit {
    fn default_tstop(self) -> f64 {
        match self {
            Circuit::Rc => 5e-3,
            Circuit::Rectifier => 60e-3,
            Circuit::PulseRc => 50e-6,
        }
    }
}

/// Device kind, spec pairs and the number of non-ground nodes.
fn netlist(circuit: Circuit) -> (Vec<(&'static str, DeviceSpec)>, usize) {
    let n1 = NodeId::new(1);
    let n2 = NodeId::new(2);
    let gnd = NodeId::GROUND;
    let specs = match circuit {
        Circuit::Rc => vec![
            (
                "V",
                DeviceSpec::new("V1", [n1, gnd]).with_waveform(Waveform::pwl(vec![
                    (0.0, 0.0),
                    (1e-3, 0.0),
                    (1.001e-3, 1.0),
                ])),
            ),
            ("R", DeviceSpec::new("R1", [n1, n2]).param("r", 1e3)),
            ("C", DeviceSpec::new("C1", [n2, gnd]).param("c", 1e-6)),
        ],
        Circuit::Rectifier => vec![
            (
                "V",
                DeviceSpec::new("V1", [n1, gnd]).with_waveform(Waveform::sin(0.0, 5.0, 50.0)),
            ),
            ("DS", DeviceSpec::new("D1", [n1, n2]).param("rs", 10.0)),
            ("R", DeviceSpec::new("RL", [n2, gnd]).param("r", 1e3)),
            ("C", DeviceSpec::new("CL", [n2, gnd]).param("c", 100e-6)),
        ],
        Circuit::PulseRc => vec![
            (
                "V",
                DeviceSpec::new("V1", [n1, gnd])
                    .with_waveform(Waveform::pulse(0.0, 1.0, 1e-6, 1e-7, 1e-7, 5e-6, 10e-6)),
            ),
            ("R", DeviceSpec::new("R1", [n1, n2]).param("r", 1e3)),
            ("C", DeviceSpec::new("C1", [n2, gnd]).param("c", 1e-9)),
        ],
    };
    (specs, 2)
}

fn build_loader(circuit: Circuit) -> Result<Loader> {
    let mut registry = DeviceRegistry::with_builtins();
    register_nested_devices(&mut registry);

    let (specs, num_nodes) = netlist(circuit);
    let devices = specs
        .iter()
        .map(|(kind, spec)| {
            registry
                .create(kind, spec)
                .with_context(|| format!("Failed to build {}", spec.name))
        })
        .collect::<Result<Vec<BoxedDevice>>>()?;
    Ok(Loader::new(devices, num_nodes)?)
}

fn load_options(path: Option<&PathBuf>) -> Result<IntegratorOptions> {
    let Some(path) = path else {
        return Ok(IntegratorOptions::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read options: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse options: {}", path.display()))
}

/// Run `circuit` from its operating point at t = 0 to `tstop`.
fn simulate(circuit: Circuit, tstop: f64, options: IntegratorOptions) -> Result<Integrator> {
    let loader = build_loader(circuit)?;
    log::info!(
        "{:?}: {} unknowns, {} devices, tstop = {:e}",
        circuit,
        loader.size(),
        loader.devices().len(),
        tstop
    );

    let mut integ = Integrator::new(loader, options)?;
    integ
        .initialize(0.0, tstop)
        .context("Failed to find the initial operating point")?;

    loop {
        let time = integ.current_time();
        let status = integ
            .integrate_to_time(tstop)
            .with_context(|| format!("Transient analysis stopped after t = {:e}", time))?;
        if status == IntegrationStatus::Finished {
            return Ok(integ);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let options = load_options(cli.options.as_ref())?;
    let tstop = cli.tstop.unwrap_or_else(|| cli.circuit.default_tstop());
    let integ = simulate(cli.circuit, tstop, options)?;
    let num_nodes = integ.loader().num_nodes();

    let header: String = (1..=num_nodes)
        .map(|i| format!(" {:>14}", format!("V({i})")))
        .collect();
    println!("{:>14}{}", "time", header);
    for point in &integ.result().points {
        let values: String = (0..num_nodes)
            .map(|i| format!(" {:>14.6e}", point.solution[i]))
            .collect();
        println!("{:>14.6e}{}", point.time, values);
    }

    let diagnostics = serde_json::to_string_pretty(&integ.diagnostics())?;
    println!();
    println!("{diagnostics}");
    Ok(())
}
