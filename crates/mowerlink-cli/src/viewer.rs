use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use mowerlink_core::{ConnectionState, Session, TelemetrySnapshot};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph};
use ratatui::Terminal;

const CHARTED: [(&str, &str, Color); 6] = [
    ("battery_percent", "Battery (%)", Color::Green),
    ("progress", "Progress (%)", Color::Cyan),
    ("wifi_rssi", "Wi-Fi RSSI (dBm)", Color::Yellow),
    ("ble_rssi", "BLE RSSI (dBm)", Color::Blue),
    ("blade_height", "Blade height (mm)", Color::Magenta),
    ("real_speed", "Speed (m/s)", Color::LightRed),
];

struct Series {
    label: &'static str,
    color: Color,
    points: VecDeque<(f64, f64)>,
}

impl Series {
    fn new(label: &'static str, color: Color) -> Self {
        Self {
            label,
            color,
            points: VecDeque::new(),
        }
    }

    fn push(&mut self, x: f64, y: f64, window_sec: f64) {
        self.points.push_back((x, y));
        while self.points.front().is_some_and(|(old, _)| x - old > window_sec) {
            self.points.pop_front();
        }
    }

    fn y_bounds(&self) -> [f64; 2] {
        let (min, max) = self
            .points
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), (_, y)| (lo.min(*y), hi.max(*y)));
        if self.points.is_empty() {
            [0.0, 1.0]
        } else if (max - min).abs() < f64::EPSILON {
            [min - 1.0, max + 1.0]
        } else {
            let pad = (max - min) * 0.1;
            [min - pad, max + pad]
        }
    }
}

struct Dashboard {
    start: Instant,
    seen_seq: Option<u64>,
    latest: Arc<TelemetrySnapshot>,
    state: ConnectionState,
    transport: String,
    series: Vec<Series>,
}

impl Dashboard {
    fn new(latest: Arc<TelemetrySnapshot>) -> Self {
        Self {
            start: Instant::now(),
            seen_seq: None,
            latest,
            state: ConnectionState::Disconnected,
            transport: "none".to_string(),
            series: CHARTED
                .iter()
                .map(|(_, label, color)| Series::new(label, *color))
                .collect(),
        }
    }

    fn refresh(&mut self, session: &Session, window_sec: f64) {
        self.state = session.state();
        self.transport = session
            .link_info()
            .map(|l| l.kind.to_string())
            .unwrap_or_else(|| "none".to_string());

        let snapshot = session.telemetry().latest();
        if self.seen_seq == Some(snapshot.seq) {
            return;
        }
        let t = self.start.elapsed().as_secs_f64();
        for (series, (key, _, _)) in self.series.iter_mut().zip(CHARTED.iter()) {
            if let Some(value) = snapshot.f64(key) {
                series.push(t, value, window_sec);
            }
        }
        self.seen_seq = Some(snapshot.seq);
        self.latest = snapshot;
    }
}

pub async fn run_viewer(session: &Session, window_sec: f64) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut dashboard = Dashboard::new(session.telemetry().latest());

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                        break;
                    }
                }
            }

            dashboard.refresh(session, window_sec);
            terminal.draw(|frame| draw(frame, &dashboard, session, window_sec))?;
            tokio::task::yield_now().await;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw(frame: &mut ratatui::Frame<'_>, dashboard: &Dashboard, session: &Session, window_sec: f64) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(0)])
        .split(frame.size());

    frame.render_widget(header(dashboard, session), rows[0]);

    let grid = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Ratio(1, 3); 3])
        .split(rows[1]);
    let now = dashboard.start.elapsed().as_secs_f64();

    for (row, pair) in grid.iter().zip(dashboard.series.chunks(2)) {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(*row);
        for (area, series) in cols.iter().zip(pair) {
            render_chart(frame, *area, series, now, window_sec);
        }
    }
}

fn state_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Degraded => Color::Yellow,
        ConnectionState::Connecting => Color::Cyan,
        ConnectionState::Disconnected => Color::Red,
    }
}

fn header(dashboard: &Dashboard, session: &Session) -> Paragraph<'static> {
    let device = session.device();
    let snapshot = &dashboard.latest;
    let stats = session.stats();

    let activity = snapshot
        .activity()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let age = snapshot
        .age(Utc::now())
        .map(|a| format!("{}s", a.as_secs()))
        .unwrap_or_else(|| "never".to_string());

    let lines = vec![
        Line::from(vec![
            Span::styled(
                format!("{} ", device.name),
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                dashboard.state.to_string(),
                Style::default().fg(state_color(dashboard.state)),
            ),
            Span::raw(format!(
                " via {}  activity={activity}  updated {age} ago  seq={}",
                dashboard.transport, snapshot.seq
            )),
        ]),
        Line::from(format!(
            "sent={} acked={} failed={} timed_out={} reconnects={}  (q to quit)",
            stats.sent, stats.acked, stats.failed, stats.timed_out, stats.reconnects
        )),
    ];

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(device.id.clone()))
}

fn render_chart(frame: &mut ratatui::Frame<'_>, area: Rect, series: &Series, now: f64, window_sec: f64) {
    let points: Vec<(f64, f64)> = series.points.iter().copied().collect();
    let x_min = (now - window_sec).max(0.0);
    let x_max = now.max(window_sec);
    let [y_lo, y_hi] = series.y_bounds();

    let dataset = Dataset::default()
        .name(series.label)
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(series.color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(series.label))
        .x_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([x_min, x_max])
                .labels(vec![
                    Span::raw(format!("{x_min:.0}s")),
                    Span::raw(format!("{x_max:.0}s")),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([y_lo, y_hi])
                .labels(vec![
                    Span::raw(format!("{y_lo:.1}")),
                    Span::raw(format!("{y_hi:.1}")),
                ]),
        );

    frame.render_widget(chart, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_drops_points_outside_window() {
        let mut series = Series::new("Battery (%)", Color::Green);

        series.push(0.0, 90.0, 10.0);
        series.push(5.0, 89.0, 10.0);
        series.push(12.0, 88.0, 10.0);

        assert_eq!(series.points.len(), 2);
        assert_eq!(series.points.front(), Some(&(5.0, 89.0)));
    }

    #[test]
    fn flat_series_gets_visible_bounds() {
        let mut series = Series::new("Progress (%)", Color::Cyan);
        series.push(1.0, 40.0, 60.0);

        assert_eq!(series.y_bounds(), [39.0, 41.0]);
        assert_eq!(Series::new("x", Color::Gray).y_bounds(), [0.0, 1.0]);
    }
}
