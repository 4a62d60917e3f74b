//! # Environment Monitor Sensor
//!
//! Coleta leituras de ambiente e envia ao servidor via TCP, uma mensagem
//! JSON por intervalo, registrando a resposta (`ack`, `alarm_active` ou
//! `error`).
//!
//! ## Uso
//! ```bash
//! envmon_sensor              # Envia indefinidamente
//! envmon_sensor --once       # Uma leitura e sai
//! envmon_sensor --count 10   # Dez leituras e sai
//! ```

mod monitor;

use anyhow::{Context, bail};
use envmon_core::config::AppConfig;
use envmon_core::protocol::Reply;
use envmon_core::types::SensorPayload;
use monitor::SensorMonitor;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let limit = parse_args(std::env::args().skip(1))?;

    // ── Carregar config ──
    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path);
    for problem in config.validate() {
        warn!("Config: {problem}");
    }

    let sensor_cfg = &config.sensor;
    let interval = Duration::from_secs_f64(sensor_cfg.interval_secs.max(0.1));
    let server_addr = sensor_cfg.server_addr();

    // ── Conexão TCP ──
    let mut stream = TcpStream::connect(&server_addr)
        .with_context(|| format!("Falha ao conectar em {server_addr}"))?;
    stream.set_nodelay(true).ok();
    info!("Conectado a {server_addr}");

    let mut monitor = SensorMonitor::new(sensor_cfg.use_host_temperature);

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   🌡 ENVIRONMENT MONITOR SENSOR – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  Servidor:  {server_addr}");
    println!("  Intervalo: {:.1}s", interval.as_secs_f64());
    match limit {
        Some(n) => println!("  Leituras:  {n}"),
        None => println!("  Leituras:  contínuo"),
    }
    println!("══════════════════════════════════════════════");
    println!();

    // ── Loop principal ──
    let mut sent = 0u64;
    while limit.is_none_or(|n| sent < n) {
        let cycle_start = Instant::now();

        let payload = monitor.collect();
        match send_reading(&mut stream, &payload)? {
            Reply::Ack => info!(
                "→ ack | temp {:.2} umid {:.2} fumaça {:.2} ruído {:.2}",
                payload.temperature_val, payload.humidity_val, payload.smoke_val, payload.noise_val
            ),
            Reply::AlarmActive => warn!(
                "→ ALARME ATIVO | temp {:.2} umid {:.2} fumaça {:.2} ruído {:.2}",
                payload.temperature_val, payload.humidity_val, payload.smoke_val, payload.noise_val
            ),
            Reply::Error => error!("→ Servidor rejeitou a leitura"),
        }
        sent += 1;

        if limit.is_some_and(|n| sent >= n) {
            break;
        }

        // Dormir pelo tempo restante do intervalo
        let elapsed = cycle_start.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    info!("{sent} leitura(s) enviada(s)");
    Ok(())
}

/// `None` = envio contínuo.
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<u64>> {
    let mut limit = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => limit = Some(1),
            "--count" => {
                let value = args.next().context("--count exige um número")?;
                let n: u64 = value
                    .parse()
                    .with_context(|| format!("--count inválido: {value}"))?;
                limit = Some(n);
            }
            other => bail!("Argumento desconhecido: {other}"),
        }
    }

    Ok(limit)
}

/// Envia uma leitura e espera o token de resposta.
fn send_reading(stream: &mut TcpStream, payload: &SensorPayload) -> anyhow::Result<Reply> {
    let message = serde_json::to_string(payload).context("Falha ao serializar leitura")?;
    stream
        .write_all(message.as_bytes())
        .context("Falha ao enviar leitura")?;

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).context("Falha ao ler resposta")?;
    if n == 0 {
        bail!("Servidor encerrou a conexão");
    }

    let token = String::from_utf8_lossy(&buf[..n]);
    Reply::parse(&token).with_context(|| format!("Resposta desconhecida: {token:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_limits() {
        assert_eq!(parse_args(args(&[])).unwrap(), None);
        assert_eq!(parse_args(args(&["--once"])).unwrap(), Some(1));
        assert_eq!(parse_args(args(&["--count", "5"])).unwrap(), Some(5));
        assert!(parse_args(args(&["--count"])).is_err());
        assert!(parse_args(args(&["--count", "x"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
    }

    #[test]
    fn sends_json_and_reads_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(b"alarm_active").unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let payload = SensorPayload {
            temperature_val: 45.5,
            humidity_val: 40.0,
            smoke_val: 700.0,
            noise_val: 30.0,
        };
        assert_eq!(send_reading(&mut stream, &payload).unwrap(), Reply::AlarmActive);

        let received = server.join().unwrap();
        assert!(received.contains("\"temperatureVal\":45.5"));
        assert!(received.contains("\"noiseVal\":30.0"));
    }

    #[test]
    fn closed_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = conn.read(&mut buf);
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let result = send_reading(&mut stream, &SensorPayload::default());
        server.join().unwrap();
        assert!(result.is_err());
    }
}
