use crate::monitor::LiveSnapshot;
use crate::pacing::StopSignal;
use chrono::NaiveDateTime;
use std::time::Duration;
use tokio::sync::watch;

#[cfg(feature = "ui")]
use crate::pacing::StopHandle;
#[cfg(feature = "ui")]
use eframe::egui;

/// Map a windowed series onto `[0, 1]` along x for plotting.
#[cfg_attr(not(feature = "ui"), allow(dead_code))]
pub fn normalized_points<T: Copy + Into<f64>>(
    entries: &[crate::window::WindowEntry<T>],
    range: (NaiveDateTime, NaiveDateTime),
) -> Vec<(f32, f64)> {
    let (start, end) = range;
    let span = (end - start).num_microseconds().unwrap_or(0) as f64;
    entries
        .iter()
        .map(|e| {
            let x = if span > 0.0 {
                (e.timestamp - start).num_microseconds().unwrap_or(0) as f64 / span
            } else {
                1.0
            };
            (x.clamp(0.0, 1.0) as f32, e.value.into())
        })
        .collect()
}

#[cfg(feature = "ui")]
pub struct LiveView {
    snapshots: watch::Receiver<LiveSnapshot>,
    stopped: StopSignal,
}

/// Open the live window on the calling thread. Closing it raises `stop`;
/// raising `stop` elsewhere (Ctrl+C) closes it.
#[cfg(feature = "ui")]
pub fn run_live_view(
    snapshots: watch::Receiver<LiveSnapshot>,
    stop: StopHandle,
    stopped: StopSignal,
) -> anyhow::Result<()> {
    let options = eframe::NativeOptions::default();
    let result = eframe::run_native(
        "CMS50D Live Data",
        options,
        Box::new(move |_cc| Box::new(LiveView { snapshots, stopped })),
    );
    stop.stop();
    result.map_err(|e| anyhow::anyhow!("live view failed: {}", e))
}

#[cfg(feature = "ui")]
impl LiveView {
    fn should_close(&self) -> bool {
        self.stopped.is_stopped()
    }

    fn draw_chart(
        ui: &mut egui::Ui,
        points: &[(f32, f64)],
        title: &str,
        color: egui::Color32,
        max_value: f64,
    ) {
        ui.group(|ui| {
            ui.label(title);
            let height = 160.0;
            let width = ui.available_width().max(300.0);

            if points.is_empty() {
                ui.label("No data yet");
                return;
            }

            let (rect, _response) =
                ui.allocate_exact_size(egui::vec2(width, height), egui::Sense::hover());
            let painter = ui.painter_at(rect);

            painter.rect_filled(rect, 0.0, egui::Color32::from_rgb(20, 20, 30));

            for i in 0..=4 {
                let y = rect.bottom() - (i as f32 / 4.0) * height;
                painter.line_segment(
                    [egui::pos2(rect.left(), y), egui::pos2(rect.right(), y)],
                    egui::Stroke::new(0.5, egui::Color32::from_rgb(60, 60, 80)),
                );
            }

            let to_screen = |(x, v): (f32, f64)| {
                let y = (v / max_value).clamp(0.0, 1.0) as f32;
                egui::pos2(rect.left() + x * width, rect.bottom() - y * height)
            };
            for pair in points.windows(2) {
                painter.line_segment(
                    [to_screen(pair[0]), to_screen(pair[1])],
                    egui::Stroke::new(1.5, color),
                );
            }
        });
    }
}

#[cfg(feature = "ui")]
impl eframe::App for LiveView {
    fn update(&mut self, ctx: &egui::Context, frame: &mut eframe::Frame) {
        if self.should_close() {
            frame.close();
            return;
        }
        let snapshot = self.snapshots.borrow().clone();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("CMS50D Live Data");
            ui.horizontal(|ui| {
                match snapshot.pulse_rate {
                    Some(hr) => ui.colored_label(egui::Color32::RED, format!("HR: {} bpm", hr)),
                    None => ui.colored_label(egui::Color32::GRAY, "HR: --"),
                };
                match snapshot.spo2 {
                    Some(spo2) => ui.colored_label(egui::Color32::LIGHT_BLUE, format!("SpO2: {}%", spo2)),
                    None => ui.colored_label(egui::Color32::GRAY, "SpO2: --"),
                };
            });
            ui.separator();

            let Some(range) = snapshot.range else {
                ui.label("Waiting for the first sample...");
                return;
            };
            ui.label(format!(
                "{} - {}",
                range.0.format("%H:%M:%S"),
                range.1.format("%H:%M:%S")
            ));

            let waveform = normalized_points(&snapshot.waveform, range);
            Self::draw_chart(ui, &waveform, "Pulse Waveform", egui::Color32::from_rgb(200, 0, 200), 128.0);
            let heart_rate = normalized_points(&snapshot.heart_rate, range);
            Self::draw_chart(ui, &heart_rate, "Pulse Rate (bpm)", egui::Color32::RED, 200.0);
        });

        ctx.request_repaint_after(Duration::from_millis(50));
    }
}

/// Console stand-in for the live window: logs the newest reading once a
/// second until `stop` is raised.
#[cfg_attr(feature = "ui", allow(dead_code))]
pub async fn run_headless_view(mut snapshots: watch::Receiver<LiveSnapshot>, mut stop: StopSignal) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => {}
        }
        if !snapshots.has_changed().unwrap_or(false) {
            continue;
        }
        let snapshot = snapshots.borrow_and_update().clone();
        if let (Some(hr), Some(spo2)) = (snapshot.pulse_rate, snapshot.spo2) {
            tracing::info!(
                "HR: {} bpm  SpO2: {}%  ({} waveform points in view)",
                hr,
                spo2,
                snapshot.waveform.len()
            );
        }
    }
}
