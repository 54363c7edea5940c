use indicatif::{ProgressBar, ProgressStyle};

#[derive(Clone, Copy, Debug)]
pub enum ProgressMode {
    Hidden,
    Visible,
}

pub trait ProgressSession {
    fn update(&mut self, inc: usize);
    fn finish(self);
}

pub trait ProgressLogger {
    type Session: ProgressSession;
    fn start_session(self, total: Option<usize>) -> Self::Session;
}

/// Terminal progress bar for long-running passes, or a no-op when hidden (e.g. under tests).
#[derive(Clone, Debug)]
pub struct BarLogger {
    mode: ProgressMode,
    name: &'static str,
}

impl BarLogger {
    pub fn new(mode: ProgressMode, name: &'static str) -> Self {
        BarLogger { mode, name }
    }
}

pub struct BarSession(Option<ProgressBar>);

impl ProgressLogger for BarLogger {
    type Session = BarSession;

    fn start_session(self, total: Option<usize>) -> BarSession {
        match self.mode {
            ProgressMode::Hidden => BarSession(None),
            ProgressMode::Visible => {
                let bar = match total {
                    Some(total) => ProgressBar::new(total as u64),
                    None => ProgressBar::new_spinner(),
                };
                bar.set_style(ProgressStyle::default_bar());
                bar.set_message(self.name);
                BarSession(Some(bar))
            }
        }
    }
}

impl ProgressSession for BarSession {
    fn update(&mut self, inc: usize) {
        if let Some(bar) = &self.0 {
            bar.inc(inc as u64);
        }
    }

    fn finish(self) {
        if let Some(bar) = self.0 {
            bar.finish_and_clear();
        }
    }
}
