//! Configuration and command-line argument parsing

use std::env;
use std::path::PathBuf;
use std::time::Duration;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub data_dir: PathBuf,
    pub max_open_stores: usize,
    /// Seconds an unused store handle stays open
    pub store_expiry: u64,

    // Accumulators
    /// Length of a current bucket in minutes; must divide a day
    pub rollup_period: u32,
    pub max_rollups: usize,
    pub retain_days: u32,
    pub retain_months: u32,
    /// Stations not heard for this many days no longer count as valid
    pub station_expiry: u32,

    // Cache
    pub flush_interval: u64,
    pub cache_expiry: u64,
    pub max_dirty: u64,

    // Networking
    pub net: bool,
    pub net_input_port: u16,
    pub net_http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_open_stores: 200,
            store_expiry: 600,
            rollup_period: 180,
            max_rollups: 2,
            retain_days: 31,
            retain_months: 12,
            station_expiry: 31,
            flush_interval: 60,
            cache_expiry: 300,
            max_dirty: 900,
            net: true,
            net_input_port: 30100,
            net_http_port: 8088,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        let args: Vec<String> = env::args().skip(1).collect();
        if args.iter().any(|a| a == "--help" || a == "-h") {
            print_help();
            std::process::exit(0);
        }

        let parsed = Self::parse(&args).and_then(|mut config| {
            if let Some(warning) = config.fix_rollup_period() {
                eprintln!("Warning: {}", warning);
            }
            config.validate().map(|_| config)
        });
        match parsed {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                print_help();
                std::process::exit(1);
            }
        }
    }

    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut config = Config::default();

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--no-net" => config.net = false,
                "--data-dir" => {
                    i += 1;
                    config.data_dir = args
                        .get(i)
                        .map(PathBuf::from)
                        .ok_or_else(|| format!("{} needs a value", flag))?;
                }
                "--rollup-period" => config.rollup_period = value(args, &mut i)?,
                "--flush-interval" => config.flush_interval = value(args, &mut i)?,
                "--cache-expiry" => config.cache_expiry = value(args, &mut i)?,
                "--max-dirty" => config.max_dirty = value(args, &mut i)?,
                "--max-open-stores" => config.max_open_stores = value(args, &mut i)?,
                "--store-expiry" => config.store_expiry = value(args, &mut i)?,
                "--max-rollups" => config.max_rollups = value(args, &mut i)?,
                "--station-expiry" => config.station_expiry = value(args, &mut i)?,
                "--retain-days" => config.retain_days = value(args, &mut i)?,
                "--retain-months" => config.retain_months = value(args, &mut i)?,
                "--net-input-port" => config.net_input_port = value(args, &mut i)?,
                "--net-http-port" => config.net_http_port = value(args, &mut i)?,
                _ => return Err(format!("Unknown option: {}", flag)),
            }
            i += 1;
        }

        Ok(config)
    }

    /// Replace a rollup period that does not divide a day with the default.
    /// Returns the warning to show when it had to be replaced.
    pub fn fix_rollup_period(&mut self) -> Option<String> {
        if self.rollup_period != 0 && MINUTES_PER_DAY % self.rollup_period == 0 {
            return None;
        }
        let rejected = self.rollup_period;
        self.rollup_period = Config::default().rollup_period;
        Some(format!(
            "--rollup-period {} does not divide a day evenly, using {}",
            rejected, self.rollup_period
        ))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_rollups == 0 {
            return Err("--max-rollups must be at least 1".to_string());
        }
        if self.max_open_stores < 2 {
            return Err("--max-open-stores must be at least 2".to_string());
        }
        if self.retain_days == 0 || self.retain_days > 36_500 || self.retain_months == 0 {
            return Err("retention must keep at least the current day and month".to_string());
        }
        if self.flush_interval == 0 {
            return Err("--flush-interval must be at least 1 second".to_string());
        }
        Ok(())
    }

    pub fn rollup_period(&self) -> Duration {
        Duration::from_secs(self.rollup_period as u64 * 60)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry)
    }

    pub fn max_dirty(&self) -> Duration {
        Duration::from_secs(self.max_dirty)
    }

    pub fn store_expiry(&self) -> Duration {
        Duration::from_secs(self.store_expiry)
    }

    pub fn station_expiry_secs(&self) -> i64 {
        self.station_expiry as i64 * 24 * 60 * 60
    }
}

fn value<T: std::str::FromStr>(args: &[String], i: &mut usize) -> Result<T, String> {
    let flag = &args[*i];
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| format!("{} needs a value", flag))?;
    raw.parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, raw))
}

fn print_help() {
    println!(
        r#"coverage-rs - radio coverage aggregation engine

Usage: coverage-rs [OPTIONS]

Options:
  --data-dir <path>         Directory holding the stores (default: ./data)
  --rollup-period <min>     Length of a current bucket, must divide a day (default: 180)
  --flush-interval <s>      Seconds between cache flushes (default: 60)
  --cache-expiry <s>        Drop clean cache entries idle this long (default: 300)
  --max-dirty <s>           Write entries dirty for this long (default: 900)
  --max-open-stores <N>     Store handles kept open (default: 200)
  --store-expiry <s>        Close store handles idle this long (default: 600)
  --max-rollups <N>         Rollup passes run at once (default: 2)
  --station-expiry <days>   Forget stations not heard for this long (default: 31)
  --retain-days <N>         Day buckets kept (default: 31)
  --retain-months <N>       Month buckets kept (default: 12)
  --net-input-port <port>   TCP port for observation input (default: 30100)
  --net-http-port <port>    HTTP status port (default: 8088)
  --no-net                  Disable networking
  --help                    Show this help
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::parse(&[]).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.rollup_period(), Duration::from_secs(3 * 3600));
        assert!(config.net);
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::parse(&args(&[
            "--data-dir",
            "/tmp/cov",
            "--rollup-period",
            "60",
            "--max-rollups",
            "4",
            "--no-net",
            "--net-http-port",
            "9000",
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/cov"));
        assert_eq!(config.rollup_period, 60);
        assert_eq!(config.max_rollups, 4);
        assert!(!config.net);
        assert_eq!(config.net_http_port, 9000);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Config::parse(&args(&["--bogus"])).is_err());
        assert!(Config::parse(&args(&["--max-dirty"])).is_err());
        assert!(Config::parse(&args(&["--max-dirty", "soon"])).is_err());
    }

    #[test]
    fn test_rollup_period_falls_back_to_default() {
        let mut config = Config::parse(&args(&["--rollup-period", "7"])).unwrap();
        let warning = config.fix_rollup_period().unwrap();
        assert!(warning.contains("using 180"));
        assert_eq!(config.rollup_period, 180);
        assert!(config.validate().is_ok());

        let mut config = Config::parse(&args(&["--rollup-period", "0"])).unwrap();
        assert!(config.fix_rollup_period().is_some());
        assert_eq!(config.rollup_period, 180);

        let mut config = Config::parse(&args(&["--rollup-period", "1440"])).unwrap();
        assert_eq!(config.fix_rollup_period(), None);
        assert_eq!(config.rollup_period, 1440);
    }
}
