//! Per-interval state machine.
//!
//! ```text
//! SearchingFrame -> SkippedQuality | PersonCheck
//! PersonCheck    -> SkippedNoPerson | Detecting
//! Detecting      -> Matching
//! Matching       -> Matching (one item per step) | Done
//! any live state -> SkippedError | SkippedTimeout
//! ```
//!
//! Each `step` is one transition. Only cancellation escapes as an error;
//! every other failure lands in a terminal state.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;

use super::budget::{classify, CallGuard, FailureKind};
use super::{SamplingInterval, Stages};
use crate::detect::{place_in_frame, ItemDetection};
use crate::frame::Frame;
use crate::gate::{crop_with_padding, PersonDetection};
use crate::ingest::{Decoded, FrameSource};
use crate::quality::{search_best_frame, SearchWindow};
use crate::results::{IntervalResult, MatchResult, SkipReason};

/// The frame chosen by the quality search.
#[derive(Clone, Debug)]
pub struct Selected {
    pub frame: Arc<Frame>,
    pub score: f64,
}

#[derive(Debug)]
pub enum IntervalState {
    SearchingFrame,
    PersonCheck {
        selected: Selected,
    },
    Detecting {
        selected: Selected,
        person: PersonDetection,
    },
    Matching {
        selected: Selected,
        person: PersonDetection,
        pending: VecDeque<ItemDetection>,
        matched: Vec<MatchResult>,
    },
    Done(IntervalResult),
    SkippedQuality(IntervalResult),
    SkippedNoPerson(IntervalResult),
    SkippedError(IntervalResult),
    SkippedTimeout(IntervalResult),
}

impl IntervalState {
    pub fn name(&self) -> &'static str {
        match self {
            IntervalState::SearchingFrame => "searching_frame",
            IntervalState::PersonCheck { .. } => "person_check",
            IntervalState::Detecting { .. } => "detecting",
            IntervalState::Matching { .. } => "matching",
            IntervalState::Done(_) => "done",
            IntervalState::SkippedQuality(_) => "skipped_quality",
            IntervalState::SkippedNoPerson(_) => "skipped_no_person",
            IntervalState::SkippedError(_) => "skipped_error",
            IntervalState::SkippedTimeout(_) => "skipped_timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.result().is_some()
    }

    pub fn result(&self) -> Option<&IntervalResult> {
        match self {
            IntervalState::Done(r)
            | IntervalState::SkippedQuality(r)
            | IntervalState::SkippedNoPerson(r)
            | IntervalState::SkippedError(r)
            | IntervalState::SkippedTimeout(r) => Some(r),
            _ => None,
        }
    }
}

pub struct IntervalMachine<'s> {
    stages: &'s Stages,
    interval: SamplingInterval,
    window: SearchWindow,
}

impl<'s> IntervalMachine<'s> {
    pub fn new(stages: &'s Stages, interval: SamplingInterval) -> Self {
        let window = SearchWindow::new(
            interval.start_time,
            interval.end_time,
            interval.search_radius,
            stages.metadata.duration,
            stages.search_step,
        );
        Self {
            stages,
            interval,
            window,
        }
    }

    pub fn window(&self) -> &SearchWindow {
        &self.window
    }

    /// Drive the machine to a terminal state.
    pub fn run(&self, source: &mut dyn FrameSource, guard: &CallGuard<'_>) -> Result<IntervalResult> {
        let mut state = IntervalState::SearchingFrame;
        loop {
            state = match state {
                IntervalState::Done(r)
                | IntervalState::SkippedQuality(r)
                | IntervalState::SkippedNoPerson(r)
                | IntervalState::SkippedError(r)
                | IntervalState::SkippedTimeout(r) => return Ok(r),
                live => {
                    if let Err(e) = guard.checkpoint() {
                        if classify(&e) == FailureKind::Cancelled {
                            return Err(e);
                        }
                        return Ok(self.skipped(SkipReason::Timeout));
                    }
                    self.step(live, source, guard)?
                }
            };
        }
    }

    /// One transition.
    pub fn step(
        &self,
        state: IntervalState,
        source: &mut dyn FrameSource,
        guard: &CallGuard<'_>,
    ) -> Result<IntervalState> {
        let from = state.name();
        let next = match state {
            IntervalState::SearchingFrame => self.search(source, guard),
            IntervalState::PersonCheck { selected } => self.person_check(selected, guard),
            IntervalState::Detecting { selected, person } => self.detect(selected, person, guard),
            IntervalState::Matching {
                selected,
                person,
                pending,
                matched,
            } => self.match_next(selected, person, pending, matched, guard),
            terminal => Ok(terminal),
        };
        let next = match next {
            Ok(state) => state,
            Err(e) => match classify(&e) {
                FailureKind::Cancelled => return Err(e),
                FailureKind::TimedOut => {
                    log::warn!("{}: timed out in {}", self.label(), from);
                    IntervalState::SkippedTimeout(self.skipped(SkipReason::Timeout))
                }
                FailureKind::Failed => {
                    log::warn!("{}: {} failed: {:#}", self.label(), from, e);
                    IntervalState::SkippedError(self.skipped(SkipReason::InferenceError))
                }
            },
        };
        log::debug!("{}: {} -> {}", self.label(), from, next.name());
        Ok(next)
    }

    fn label(&self) -> String {
        format!("interval {} @{:.2}s", self.interval.index, self.interval.start_time)
    }

    fn skipped(&self, reason: SkipReason) -> IntervalResult {
        IntervalResult::skipped(self.interval.start_time, reason)
    }

    fn partial(&self, reason: SkipReason, selected: &Selected) -> IntervalResult {
        IntervalResult {
            frame_timestamp: Some(selected.frame.timestamp),
            quality_score: Some(selected.score),
            ..self.skipped(reason)
        }
    }

    fn search(&self, source: &mut dyn FrameSource, guard: &CallGuard<'_>) -> Result<IntervalState> {
        let outcome = search_best_frame(&self.window, &self.stages.assessor, |t| {
            match guard.io("frame decode", || source.seek_and_decode(t))? {
                Decoded::Frame(frame) => Ok(Some(frame)),
                Decoded::EndOfStream => Ok(None),
            }
        })?;
        let Some(candidate) = outcome.selected else {
            return Ok(IntervalState::SkippedQuality(self.skipped(SkipReason::LowQuality)));
        };
        let selected = Selected {
            frame: Arc::new(candidate.frame),
            score: candidate.assessment.score,
        };
        if !outcome.passed && self.stages.strict_quality {
            return Ok(IntervalState::SkippedQuality(
                self.partial(SkipReason::LowQuality, &selected),
            ));
        }
        if let Some(artifacts) = &self.stages.artifacts {
            if let Err(e) = artifacts.save_frame(self.interval.index, &selected.frame) {
                log::warn!("{}: {:#}", self.label(), e);
            }
        }
        Ok(IntervalState::PersonCheck { selected })
    }

    fn person_check(&self, selected: Selected, guard: &CallGuard<'_>) -> Result<IntervalState> {
        let gate = self.stages.gate.clone();
        let frame = Arc::clone(&selected.frame);
        let raw = guard.inference("person detection", move || gate.detect_raw(&frame))?;
        match self.stages.gate.select(&selected.frame, raw) {
            Some(person) => Ok(IntervalState::Detecting { selected, person }),
            None => Ok(IntervalState::SkippedNoPerson(
                self.partial(SkipReason::NoPerson, &selected),
            )),
        }
    }

    fn detect(
        &self,
        selected: Selected,
        person: PersonDetection,
        guard: &CallGuard<'_>,
    ) -> Result<IntervalState> {
        let frame = &selected.frame;
        let mut items = Vec::new();
        if let Some((crop, origin)) =
            crop_with_padding(frame, &person.bbox, self.stages.crop_padding_ratio)
        {
            let crop = Arc::new(crop);
            for detector in &self.stages.item_detectors {
                let what = format!("{} detection", detector.category());
                let mut passes = Vec::with_capacity(detector.scales().len());
                for &scale in detector.scales() {
                    let pass = detector.clone();
                    let input = Arc::clone(&crop);
                    passes.push(guard.inference(&what, move || pass.detect_at_scale(&input, scale))?);
                }
                items.extend(place_in_frame(
                    detector.merge(passes),
                    detector.category(),
                    origin,
                    frame.width(),
                    frame.height(),
                ));
            }
        }
        Ok(IntervalState::Matching {
            selected,
            person,
            pending: items.into(),
            matched: Vec::new(),
        })
    }

    fn match_next(
        &self,
        selected: Selected,
        person: PersonDetection,
        mut pending: VecDeque<ItemDetection>,
        mut matched: Vec<MatchResult>,
        guard: &CallGuard<'_>,
    ) -> Result<IntervalState> {
        let Some(item) = pending.pop_front() else {
            return Ok(IntervalState::Done(IntervalResult {
                timestamp: self.interval.start_time,
                skip_reason: SkipReason::None,
                frame_timestamp: Some(selected.frame.timestamp),
                quality_score: Some(selected.score),
                person: Some(person),
                items: matched,
            }));
        };

        let frame = &selected.frame;
        let matches = match item.bbox.pixel_region(frame.width(), frame.height()) {
            None => Vec::new(),
            Some(region) => {
                let crop = Arc::new(frame.crop(region));
                if let Some(artifacts) = &self.stages.artifacts {
                    if let Err(e) =
                        artifacts.save_crop(self.interval.index, matched.len(), &item.label, &crop)
                    {
                        log::warn!("{}: {:#}", self.label(), e);
                    }
                }
                let embedder = Arc::clone(&self.stages.embedder);
                let embedding = guard.inference("embedding", move || embedder.embed(&crop))?;
                self.stages
                    .indexes
                    .query(&item.category, &embedding, self.stages.top_k)?
            }
        };
        matched.push(MatchResult { item, matches });
        Ok(IntervalState::Matching {
            selected,
            person,
            pending,
            matched,
        })
    }
}
