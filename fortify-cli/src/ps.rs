//! `fortify ps` and `fortify show`.

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Result, bail};
use fortify::{Config, Helpers, LauncherRecord, Std, Store, System};

/// Every recorded launcher across all target users.
fn records() -> Result<Vec<LauncherRecord>> {
    let store = Store::new(&Std::default().paths().run_dir);
    let joined = store.join();
    store.close()?;
    Ok(joined?.into_values().collect())
}

/// Renders `d` as `1h2m3s`, dropping leading zero units.
fn uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s}s"),
        _ => format!("{h}h{m}m{s}s"),
    }
}

/// Time since `record` started, zero when the clock went backwards.
fn age(record: &LauncherRecord) -> Duration {
    SystemTime::now().duration_since(record.time).unwrap_or_default()
}

pub(crate) fn ps(short: bool, json: bool) -> Result<()> {
    let mut list = records()?;
    list.sort_by_key(|r| r.time);

    if json {
        if short {
            let ids: Vec<String> = list.iter().map(|r| r.id.to_string()).collect();
            println!("{}", serde_json::to_string_pretty(&ids)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        return Ok(());
    }
    if short {
        for r in &list {
            println!("{}", r.id);
        }
        return Ok(());
    }

    if list.is_empty() {
        println!("No launchers.");
        return Ok(());
    }
    println!("{:<8} {:<28} {:<10} {:<10} ENABLEMENTS", "PID", "APP", "INSTANCE", "UPTIME");
    for r in &list {
        let app = if r.config.id.is_empty() {
            format!("app {}", r.config.confinement.app_id)
        } else {
            r.config.id.clone()
        };
        let id = r.id.to_string();
        println!(
            "{:<8} {:<28} {:<10} {:<10} {}",
            r.pid,
            app,
            &id[..id.len().min(8)],
            uptime(age(r)),
            r.enablements
        );
    }
    Ok(())
}

pub(crate) fn show(target: Option<&str>, short: bool, json: bool) -> Result<()> {
    let Some(target) = target else {
        return host(json);
    };

    let path = Path::new(target);
    if path.is_file() {
        let config = Config::load(path)?;
        return print_config(&config, short, json);
    }

    let mut matches = records()?.into_iter().filter(|r| r.id.to_string().starts_with(target));
    let record = match (matches.next(), matches.next()) {
        (Some(record), None) => record,
        (None, _) => bail!("no launcher or configuration file matches {target}"),
        (Some(_), Some(_)) => bail!("{target} is ambiguous, use a longer prefix"),
    };

    if json {
        let mut value = serde_json::to_value(&record)?;
        if short {
            if let Some(sandbox) = value.pointer_mut("/config/confinement/sandbox") {
                *sandbox = serde_json::Value::Null;
            }
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("Instance:    {} ({})", record.id, record.pid);
    println!("Uid:         {}", record.uid);
    println!("Uptime:      {}", uptime(age(&record)));
    println!("Command:     {}", record.argv.join(" "));
    print_config(&record.config, short, false)
}

/// Summarizes `config`; `short` leaves out the sandbox layout.
fn print_config(config: &Config, short: bool, json: bool) -> Result<()> {
    if json {
        let mut config = config.clone();
        if short {
            config.confinement.sandbox = None;
        }
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let c = &config.confinement;
    if !config.id.is_empty() {
        println!("App:         {}", config.id);
    }
    println!("Aid:         {}", c.app_id);
    if !c.groups.is_empty() {
        println!("Groups:      {}", c.groups.join(", "));
    }
    println!("Home:        {}", c.home.display());
    if let Some(inner) = &c.inner {
        println!("Inner:       {}", inner.display());
    }
    println!("Enablements: {}", c.enablements);
    println!("Program:     {}", config.command.join(" "));
    if short {
        return Ok(());
    }

    let Some(sandbox) = &c.sandbox else {
        println!("Sandbox:     mirrors the host");
        return Ok(());
    };
    if !sandbox.hostname.is_empty() {
        println!("Hostname:    {}", sandbox.hostname);
    }
    for fs in &sandbox.filesystem {
        let mode = if fs.write { "rw" } else { "ro" };
        let optional = if fs.require { "" } else { " (optional)" };
        println!("Filesystem:  {} {mode} {}{optional}", fs.src.display(), fs.target().display());
    }
    for (target, link) in &sandbox.symlink {
        println!("Symlink:     {} -> {}", link.display(), target.display());
    }
    for path in &sandbox.cover {
        println!("Cover:       {}", path.display());
    }
    Ok(())
}

/// Host locations and helpers fortify would use.
fn host(json: bool) -> Result<()> {
    let sys = Std::default();
    let paths = sys.paths();
    let helpers = Helpers::discover()?;
    if json {
        let obj = serde_json::json!({
            "uid": sys.geteuid(),
            "share": paths.share,
            "runtime": paths.runtime,
            "run_dir": paths.run_dir,
            "fsu": helpers.fsu,
            "init": helpers.init,
            "dbus_proxy": helpers.dbus_proxy,
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }
    println!("Uid:         {}", sys.geteuid());
    println!("Share:       {}", paths.share.display());
    println!("Runtime:     {}", paths.runtime.display());
    println!("Run dir:     {}", paths.run_dir.display());
    println!("Setuid:      {}", helpers.fsu.display());
    println!("Init:        {}", helpers.init.display());
    println!("D-Bus proxy: {}", helpers.dbus_proxy.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_drops_leading_zero_units() {
        assert_eq!(uptime(Duration::from_secs(9)), "9s");
        assert_eq!(uptime(Duration::from_secs(61)), "1m1s");
        assert_eq!(uptime(Duration::from_secs(3600 + 2)), "1h0m2s");
    }
}
