use crate::client::{Connector, PageError, Session};
use crate::models::printer::{ConsumableReading, Device, FieldValue, Status};
use crate::profiles::{Container, Locator, Profile, ProfileSet};
use chrono::Utc;
use log::{debug, error, info, warn};
use scraper::{ElementRef, Html, Selector};
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CollectSettings {
    pub workers: NonZeroUsize,
    /// Path of the status page below the device root, e.g. `""` or `"hp/device/info"`.
    pub status_path: String,
    /// Upper bound for the container to show up.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

pub struct Collector<'a, C: Connector> {
    connector: &'a C,
    profiles: &'a ProfileSet,
    settings: &'a CollectSettings,
}

impl<'a, C: Connector> Collector<'a, C> {
    pub fn new(connector: &'a C, profiles: &'a ProfileSet, settings: &'a CollectSettings) -> Self {
        Collector {
            connector,
            profiles,
            settings,
        }
    }

    /// Collect every device on a bounded pool and wait for all of them.
    ///
    /// Devices without an address contribute nothing. Result order is not
    /// related to input order.
    pub fn collect_all(&self, devices: &[Device]) -> Vec<ConsumableReading> {
        let targets: Vec<&Device> = devices
            .iter()
            .filter(|d| {
                if d.address.is_none() {
                    warn!("Collect: skipping {} ({}): no usable address", d.display_name, d.group);
                }
                d.address.is_some()
            })
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<&Device>();
        for device in &targets {
            // receiver is alive until the end of this function
            let _ = job_tx.send(device);
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded::<Vec<ConsumableReading>>();
        let workers = self.settings.workers.get().min(targets.len());
        info!("Collect: {} device(s) on {} worker(s)", targets.len(), workers);

        thread::scope(|scope| {
            for n in 0..workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("collect-{}", n))
                    .spawn_scoped(scope, move || {
                        for device in jobs.iter() {
                            if results.send(self.collect_guarded(device)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    error!("Collect: failed to spawn worker {}: {}", n, e);
                }
            }
        });

        // Jobs left behind when no worker could be spawned run here.
        for device in job_rx.try_iter() {
            let _ = result_tx.send(self.collect_guarded(device));
        }
        drop(result_tx);

        result_rx.iter().flatten().collect()
    }

    fn collect_guarded(&self, device: &Device) -> Vec<ConsumableReading> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.collect(device))) {
            Ok(readings) => readings,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let address = device.address.as_deref().unwrap_or_default();
                error!("Collect: {} ({}) aborted: {}", device.display_name, address, message);
                vec![ConsumableReading::device_failure(
                    address,
                    Utc::now(),
                    Status::UnknownError(format!("collector panicked: {}", message)),
                )]
            }
        }
    }

    /// Read one device: one reading per expected consumable on success, a
    /// single device-level reading otherwise.
    pub fn collect(&self, device: &Device) -> Vec<ConsumableReading> {
        let Some(address) = device.address.as_deref() else {
            return Vec::new();
        };
        let captured_at = Utc::now();

        let Some(profile) = self.profiles.for_group(&device.group) else {
            let status = Status::UnknownError(format!("no extraction profile for group {:?}", device.group));
            warn!("Collect: {} ({}) -> {}", device.display_name, address, status);
            return vec![ConsumableReading::device_failure(address, captured_at, status)];
        };

        let outcome = {
            let mut session = self.connector.open(address);
            self.scrape(&mut session, address, profile, &device.consumables)
        };

        match outcome {
            Ok(fields) => {
                let missing = fields.iter().filter(|(_, v)| *v == FieldValue::Missing).count();
                if missing > 0 {
                    debug!(
                        "Collect: {} ({}) ok with {} missing field(s)",
                        device.display_name, address, missing
                    );
                }
                fields
                    .into_iter()
                    .map(|(name, value)| ConsumableReading {
                        address: address.to_string(),
                        consumable: Some(name),
                        value,
                        captured_at,
                        status: Status::Ok,
                    })
                    .collect()
            }
            Err(status) => {
                warn!("Collect: {} ({}) -> {}", device.display_name, address, status);
                vec![ConsumableReading::device_failure(address, captured_at, status)]
            }
        }
    }

    fn scrape<S: Session>(
        &self,
        session: &mut S,
        address: &str,
        profile: &Profile,
        consumables: &[String],
    ) -> Result<Vec<(String, FieldValue)>, Status> {
        let url = status_url(address, &self.settings.status_path)?;
        let deadline = Instant::now() + self.settings.wait_timeout;

        let document = loop {
            let html = session.fetch(&url).map_err(status_from_page_error)?;
            let root = Html::parse_document(&html);
            if let Some(doc) = resolve_container(session, root, address, &url, &profile.container)? {
                break doc;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("Collect: {} container never appeared within {:?}", address, self.settings.wait_timeout);
                return Err(Status::Unavailable);
            }
            thread::sleep(self.settings.poll_interval.min(deadline - now));
        };

        let fields: Vec<(String, FieldValue)> = consumables
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let value = extract_field(&document, profile.locators_for(name), index);
                (name.clone(), value)
            })
            .collect();

        if fields.iter().all(|(_, v)| *v == FieldValue::Missing) {
            return Err(Status::NotFound);
        }
        Ok(fields)
    }
}

fn status_url(address: &str, path: &str) -> Result<String, Status> {
    let url = format!("http://{}/{}", address, path.trim_start_matches('/'));
    url.parse::<http::Uri>()
        .map_err(|e| Status::UnknownError(format!("invalid status url {:?}: {}", url, e)))?;
    Ok(url)
}

/// Absolute URL of a frame `src` found on `page_url`.
fn frame_url(address: &str, page_url: &str, src: &str) -> String {
    if src.starts_with("http://") || src.starts_with("https://") {
        src.to_string()
    } else if src.starts_with('/') {
        format!("http://{}{}", address, src)
    } else {
        match page_url.rfind('/') {
            Some(i) if i + 1 > "http://".len() => format!("{}{}", &page_url[..=i], src),
            _ => format!("{}/{}", page_url, src),
        }
    }
}

/// The document fields are read from, or `None` while the container is absent.
fn resolve_container<S: Session>(
    session: &mut S,
    root: Html,
    address: &str,
    page_url: &str,
    container: &Container,
) -> Result<Option<Html>, Status> {
    match container {
        Container::Element { selector } => {
            let sel = parse_selector(selector)?;
            let present = root.select(&sel).next().is_some();
            Ok(present.then_some(root))
        }
        Container::Frame { id } => {
            let sel = parse_selector(&format!(
                "frame[id=\"{id}\"], iframe[id=\"{id}\"], frame[name=\"{id}\"], iframe[name=\"{id}\"]"
            ))?;
            let src = match root.select(&sel).next() {
                None => return Ok(None),
                Some(frame) => frame.value().attr("src").map(str::trim).unwrap_or_default().to_string(),
            };
            if src.is_empty() {
                debug!("Collect: {} frame {:?} has no src", address, id);
                return Err(Status::NotFound);
            }
            let url = frame_url(address, page_url, &src);
            let html = session.fetch(&url).map_err(status_from_page_error)?;
            Ok(Some(Html::parse_document(&html)))
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, Status> {
    Selector::parse(selector).map_err(|e| Status::UnknownError(format!("invalid selector {:?}: {}", selector, e)))
}

/// Walk a locator chain; the first locator that yields text wins.
fn extract_field(document: &Html, chain: &[Locator], index: usize) -> FieldValue {
    for locator in chain {
        let css = locator.selector(index);
        let Ok(sel) = Selector::parse(&css) else {
            debug!("Collect: skipping unparsable locator {:?}", css);
            continue;
        };
        let hit = match locator {
            Locator::Id { .. } => document.select(&sel).next().map(element_text),
            Locator::Css { nth, .. } => document.select(&sel).nth(*nth).map(element_text),
            Locator::CssContaining { text, .. } => document
                .select(&sel)
                .map(element_text)
                .find(|t| t.contains(text.as_str())),
        };
        match hit {
            Some(text) if !text.is_empty() => return FieldValue::from_text(&text),
            _ => debug!("Collect: locator {:?} missed", css),
        }
    }
    FieldValue::Missing
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn status_from_page_error(err: PageError) -> Status {
    match err {
        PageError::Offline(_) => Status::OffNetwork,
        PageError::Timeout(_) => Status::Unavailable,
        PageError::Http { status: 404, .. } => Status::NotFound,
        other => Status::UnknownError(other.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum FakePage {
        Html(String),
        Offline,
        Timeout,
        Status(u16),
        Panic,
        /// Serves `booting` until `ready_after` fetches have been made.
        Warming {
            ready_after: usize,
            hits: Arc<AtomicUsize>,
            booting: String,
            ready: String,
        },
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        pages: Arc<HashMap<String, FakePage>>,
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct FakeSession {
        pages: Arc<HashMap<String, FakePage>>,
        closed: Arc<AtomicUsize>,
    }

    impl Session for FakeSession {
        fn fetch(&mut self, url: &str) -> Result<String, PageError> {
            match self.pages.get(url) {
                Some(FakePage::Html(body)) => Ok(body.clone()),
                Some(FakePage::Offline) => Err(PageError::Offline(url.into())),
                Some(FakePage::Timeout) => Err(PageError::Timeout(url.into())),
                Some(FakePage::Status(status)) => Err(PageError::Http {
                    status: *status,
                    url: url.into(),
                }),
                Some(FakePage::Panic) => panic!("driver crashed on {url}"),
                Some(FakePage::Warming {
                    ready_after,
                    hits,
                    booting,
                    ready,
                }) => {
                    let seen = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if seen >= *ready_after { ready.clone() } else { booting.clone() })
                }
                None => Err(PageError::Http {
                    status: 404,
                    url: url.into(),
                }),
            }
        }
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Connector for FakeConnector {
        type Session = FakeSession;

        fn open(&self, _address: &str) -> FakeSession {
            self.opened.fetch_add(1, Ordering::SeqCst);
            FakeSession {
                pages: Arc::clone(&self.pages),
                closed: Arc::clone(&self.closed),
            }
        }
    }

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/data/{name}")).expect("fixture present")
    }

    fn connector(pages: Vec<(&str, FakePage)>) -> FakeConnector {
        FakeConnector {
            pages: Arc::new(pages.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
            ..Default::default()
        }
    }

    fn settings() -> CollectSettings {
        CollectSettings {
            workers: NonZeroUsize::new(3).unwrap(),
            status_path: String::new(),
            wait_timeout: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn device(address: Option<&str>, group: &str, consumables: &[&str]) -> Device {
        Device {
            printer_id: 1,
            group: group.into(),
            display_name: format!("printer {}", address.unwrap_or("-")),
            model: None,
            address: address.map(str::to_string),
            consumables: consumables.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn value_of<'r>(readings: &'r [ConsumableReading], name: &str) -> &'r FieldValue {
        &readings
            .iter()
            .find(|r| r.consumable.as_deref() == Some(name))
            .expect("reading present")
            .value
    }

    #[test]
    fn reads_hp_supply_gauges_by_position() {
        let conn = connector(vec![("http://10.0.0.5/", FakePage::Html(fixture("hp_supplies.html")))]);
        let profiles = ProfileSet::builtin();
        let cfg = settings();
        let collector = Collector::new(&conn, &profiles, &cfg);

        let dev = device(
            Some("10.0.0.5"),
            "hp-supply-gauge",
            &["Black Toner", "Maintenance Kit", "Feed Kit"],
        );
        let readings = collector.collect(&dev);

        assert_eq!(readings.len(), 3);
        assert!(readings.iter().all(|r| r.status == Status::Ok));
        assert_eq!(readings[0].percent(), Some(45.0));
        assert_eq!(readings[1].percent(), Some(80.0));
        assert_eq!(readings[2].value, FieldValue::Missing);
        assert_eq!(readings[2].percent(), None);
        assert_eq!(conn.opened.load(Ordering::SeqCst), 1);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn follows_frame_and_falls_back_to_level_cells() {
        let conn = connector(vec![
            ("http://10.0.0.6/", FakePage::Html(fixture("ricoh_root.html"))),
            (
                "http://10.0.0.6/web/guest/es/websys/webArch/mainFrame.cgi",
                FakePage::Html(fixture("ricoh_mono_status.html")),
            ),
        ]);
        let profiles = ProfileSet::builtin();
        let cfg = settings();
        let collector = Collector::new(&conn, &profiles, &cfg);

        let readings = collector.collect(&device(Some("10.0.0.6"), "ricoh-mono", &["Black Toner", "Black Imaging Unit"]));

        assert_eq!(value_of(&readings, "Black Toner"), &FieldValue::from_text("60%"));
        // no #imagine_list on this page: fallback cell wins
        assert_eq!(value_of(&readings, "Black Imaging Unit"), &FieldValue::from_text("20%"));
    }

    #[test]
    fn reads_colour_grid_rows() {
        let conn = connector(vec![
            ("http://10.0.0.7/", FakePage::Html(fixture("ricoh_root.html"))),
            (
                "http://10.0.0.7/web/guest/es/websys/webArch/mainFrame.cgi",
                FakePage::Html(fixture("ricoh_color_status.html")),
            ),
        ]);
        let profiles = ProfileSet::builtin();
        let cfg = settings();
        let collector = Collector::new(&conn, &profiles, &cfg);

        let names = ["Black Toner", "Black Imaging Unit", "Cyan Toner", "Yellow Imaging Unit"];
        let readings = collector.collect(&device(Some("10.0.0.7"), "ricoh-color", &names));

        let levels: Vec<Option<f64>> = names.iter().map(|n| {
            readings.iter().find(|r| r.consumable.as_deref() == Some(*n)).and_then(|r| r.percent())
        }).collect();
        assert_eq!(levels, vec![Some(70.0), Some(55.0), Some(35.0), Some(90.0)]);
    }

    #[test]
    fn classifies_failures() {
        let conn = connector(vec![
            ("http://10.0.1.1/", FakePage::Offline),
            ("http://10.0.1.2/", FakePage::Timeout),
            ("http://10.0.1.3/", FakePage::Html("<html><body>booting</body></html>".into())),
            ("http://10.0.1.4/", FakePage::Html("<div id=\"SupplyName0\">Toner</div>".into())),
            ("http://10.0.1.5/", FakePage::Status(500)),
        ]);
        let profiles = ProfileSet::builtin();
        let cfg = settings();
        let collector = Collector::new(&conn, &profiles, &cfg);

        let status_of = |addr: &str| {
            let readings = collector.collect(&device(Some(addr), "hp-supply-gauge", &["Black Toner"]));
            assert_eq!(readings.len(), 1);
            assert_eq!(readings[0].consumable, None);
            readings[0].status.clone()
        };

        assert_eq!(status_of("10.0.1.1"), Status::OffNetwork);
        assert_eq!(status_of("10.0.1.2"), Status::Unavailable);
        // container never shows up
        assert_eq!(status_of("10.0.1.3"), Status::Unavailable);
        // container present, no field markup
        assert_eq!(status_of("10.0.1.4"), Status::NotFound);
        assert!(matches!(status_of("10.0.1.5"), Status::UnknownError(_)));
        // page not served at all
        assert_eq!(status_of("10.0.1.6"), Status::NotFound);

        assert_eq!(conn.opened.load(Ordering::SeqCst), 6);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn waits_for_container_across_fetches() {
        let hits = Arc::new(AtomicUsize::new(0));
        let conn = connector(vec![(
            "http://10.0.0.8/",
            FakePage::Warming {
                ready_after: 2,
                hits: Arc::clone(&hits),
                booting: "<html><body>booting</body></html>".into(),
                ready: fixture("hp_supplies.html"),
            },
        )]);
        let profiles = ProfileSet::builtin();
        let cfg = CollectSettings {
            wait_timeout: Duration::from_secs(5),
            ..settings()
        };
        let collector = Collector::new(&conn, &profiles, &cfg);

        let readings = collector.collect(&device(Some("10.0.0.8"), "hp-supply-gauge", &["Black Toner"]));

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].status, Status::Ok);
        assert_eq!(readings[0].percent(), Some(45.0));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(conn.opened.load(Ordering::SeqCst), 1);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_group_is_an_unknown_error() {
        let conn = connector(vec![]);
        let profiles = ProfileSet::builtin();
        let cfg = settings();
        let collector = Collector::new(&conn, &profiles, &cfg);

        let readings = collector.collect(&device(Some("10.0.2.1"), "plotters", &["Black Toner"]));
        assert!(matches!(&readings[0].status, Status::UnknownError(msg) if msg.contains("plotters")));
        assert_eq!(conn.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_skips_addressless_devices_and_survives_panics() {
        let conn = connector(vec![
            ("http://10.0.3.1/", FakePage::Html(fixture("hp_supplies.html"))),
            ("http://10.0.3.2/", FakePage::Panic),
            ("http://10.0.3.3/", FakePage::Offline),
            ("http://10.0.3.4/", FakePage::Html(fixture("hp_supplies.html"))),
        ]);
        let profiles = ProfileSet::builtin();
        let cfg = settings();
        let collector = Collector::new(&conn, &profiles, &cfg);

        let devices = vec![
            device(Some("10.0.3.1"), "hp-supply-gauge", &["Black Toner"]),
            device(Some("10.0.3.2"), "hp-supply-gauge", &["Black Toner"]),
            device(None, "hp-supply-gauge", &["Black Toner"]),
            device(Some("10.0.3.3"), "hp-supply-gauge", &["Black Toner"]),
            device(Some("10.0.3.4"), "hp-supply-gauge", &["Black Toner"]),
        ];
        let readings = collector.collect_all(&devices);

        let status_of = |addr: &str| {
            readings
                .iter()
                .find(|r| r.address == addr)
                .map(|r| r.status.clone())
                .expect("reading for address")
        };
        assert_eq!(readings.len(), 4);
        assert_eq!(status_of("10.0.3.1"), Status::Ok);
        assert!(matches!(status_of("10.0.3.2"), Status::UnknownError(msg) if msg.contains("panicked")));
        assert_eq!(status_of("10.0.3.3"), Status::OffNetwork);
        assert_eq!(status_of("10.0.3.4"), Status::Ok);

        assert_eq!(conn.opened.load(Ordering::SeqCst), 4);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn builds_urls() {
        assert_eq!(status_url("10.0.0.1", "").unwrap(), "http://10.0.0.1/");
        assert_eq!(status_url("10.0.0.1", "/hp/device/info").unwrap(), "http://10.0.0.1/hp/device/info");
        assert!(status_url("10.0.0 .1", "").is_err());

        assert_eq!(frame_url("10.0.0.1", "http://10.0.0.1/", "main.cgi"), "http://10.0.0.1/main.cgi");
        assert_eq!(
            frame_url("10.0.0.1", "http://10.0.0.1/web/index.html", "frame/main.cgi"),
            "http://10.0.0.1/web/frame/main.cgi"
        );
        assert_eq!(frame_url("10.0.0.1", "http://10.0.0.1/web/", "/top.cgi"), "http://10.0.0.1/top.cgi");
    }
}
