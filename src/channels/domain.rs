use tokio::sync::mpsc;
use crate::alert::domain::AlertTransition;
use crate::config::channels::{ALERT_CAPACITY, DEAD_LETTER_CAPACITY, PATCH_CAPACITY, WATCHDOG_CAPACITY};
use crate::dead_letter::domain::DeadLetter;
use crate::heartbeat::domain::Event;
use crate::projection::domain::CommittedPatch;


pub struct Channels {
    pub supervisor_to_watchdog: mpsc::Sender<Event>,
    pub watchdog_from_supervisor: mpsc::Receiver<Event>,

    pub watchdog_to_supervisor: mpsc::Sender<Event>,
    pub supervisor_from_watchdog: mpsc::Receiver<Event>,

    pub workers_to_evaluator: mpsc::Sender<CommittedPatch>,
    pub evaluator_from_workers: mpsc::Receiver<CommittedPatch>,

    pub evaluator_to_dispatcher: mpsc::Sender<AlertTransition>,
    pub dispatcher_from_evaluator: mpsc::Receiver<AlertTransition>,

    pub workers_to_dead_letter: mpsc::Sender<DeadLetter>,
    pub dead_letter_from_workers: mpsc::Receiver<DeadLetter>,
}


impl Channels {
    pub fn new() -> Channels {
        let (s_to_w, w_from_s) = mpsc::channel::<Event>(WATCHDOG_CAPACITY);
        let (w_to_s, s_from_w) = mpsc::channel::<Event>(WATCHDOG_CAPACITY);
        let (wk_to_ev, ev_from_wk) = mpsc::channel::<CommittedPatch>(PATCH_CAPACITY);
        let (ev_to_dp, dp_from_ev) = mpsc::channel::<AlertTransition>(ALERT_CAPACITY);
        let (wk_to_dl, dl_from_wk) = mpsc::channel::<DeadLetter>(DEAD_LETTER_CAPACITY);

        Self {
            supervisor_to_watchdog: s_to_w,
            watchdog_from_supervisor: w_from_s,
            watchdog_to_supervisor: w_to_s,
            supervisor_from_watchdog: s_from_w,
            workers_to_evaluator: wk_to_ev,
            evaluator_from_workers: ev_from_wk,
            evaluator_to_dispatcher: ev_to_dp,
            dispatcher_from_evaluator: dp_from_ev,
            workers_to_dead_letter: wk_to_dl,
            dead_letter_from_workers: dl_from_wk,
        }
    }
}
