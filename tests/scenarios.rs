// Scenario tests: complete programs through the simulator

#[cfg(test)]
mod tests {
    use millcore::machine::MachineMode;
    use millcore::motion::junction::junction_velocity;
    use millcore::motion::{HoldState, MoveKind, calculate_unit_vector};
    use millcore::report::Response;
    use millcore::scheduler::Signal;
    use millcore::sim::{StepRecord, TICKS_PER_PASS};
    use millcore::{DDA_FREQUENCY_HZ, MachineConfig, PLANNER_BUFFER_SIZE, RTC_PERIOD_MS, Simulator};

    const SECOND: u64 = DDA_FREQUENCY_HZ as u64;

    fn recording_sim() -> Simulator {
        let mut sim = Simulator::new(MachineConfig::default());
        sim.pins_mut().set_recording(true);
        sim
    }

    fn steps_per_mm(sim: &Simulator, motor: usize) -> f64 {
        sim.controller().config().steps_per_unit(motor)
    }

    /// End point (x, y) in mm of each block, in execution order.
    fn block_endpoints(log: &[StepRecord], spm: f64) -> Vec<(u32, f64, f64)> {
        let mut pos = [0i64; 2];
        let mut out: Vec<(u32, f64, f64)> = Vec::new();
        for r in log.iter().filter(|r| r.motor < 2) {
            if let Some(last) = out.last() {
                if last.0 != r.seq {
                    out.push((r.seq, 0.0, 0.0));
                }
            } else {
                out.push((r.seq, 0.0, 0.0));
            }
            pos[r.motor] = r.position;
            if let Some(last) = out.last_mut() {
                last.1 = pos[0] as f64 / spm;
                last.2 = pos[1] as f64 / spm;
            }
        }
        out
    }

    #[test]
    fn rapid_move_lands_on_exact_step_count() {
        let mut sim = recording_sim();
        sim.send("G21 G90 G0 X10 Y0");
        assert!(sim.run_until_idle(5 * SECOND));

        let expected = (10.0 * steps_per_mm(&sim, 0)).round() as i64;
        assert_eq!(sim.pins().position()[0], expected);
        assert_eq!(sim.pins().position()[1], 0);
        assert_eq!(sim.pins().pulses()[1], 0);
        let report = sim.controller().status_report();
        assert_eq!(report.position[0], 10.0);
        assert_eq!(report.position[1], 0.0);
        assert_eq!(sim.controller().mode(), MachineMode::Ready);
    }

    #[test]
    fn collinear_moves_keep_cruise_through_junction() {
        let mut sim = recording_sim();
        sim.send("G1 F600 X5\nX10");
        // Both lines are in the planner before either is released.
        assert!(sim.run_until(SECOND, |s| s.controller().planner().iter_blocks().count() == 2));
        let blocks: Vec<_> = sim.controller().planner().iter_blocks().cloned().collect();
        assert_eq!(blocks[1].junction_vmax, 600.0);
        assert!((blocks[0].profile.exit_velocity - 600.0).abs() < 1e-9);
        assert!((blocks[1].profile.entry_velocity - 600.0).abs() < 1e-9);

        // Velocity of the runtime's last segment of block 1 and first of block 2.
        let first = blocks[0].seq;
        let mut last_of_first = None;
        let mut first_of_second = None;
        let done = sim.run_until(5 * SECOND, |s| {
            let rt = s.controller().runtime();
            match rt.active_seq() {
                Some(seq) if seq == first => last_of_first = Some(rt.current_velocity()),
                Some(_) if first_of_second.is_none() && rt.current_velocity() > 0.0 => {
                    first_of_second = Some(rt.current_velocity())
                }
                _ => {}
            }
            s.controller().is_idle()
        });
        assert!(done);
        assert!((last_of_first.unwrap() - 600.0).abs() < 1e-6);
        assert!((first_of_second.unwrap() - 600.0).abs() < 1e-6);
        assert_eq!(sim.pins().position()[0], (10.0 * steps_per_mm(&sim, 0)).round() as i64);
    }

    #[test]
    fn right_angle_corner_slows_to_junction_velocity() {
        let mut sim = recording_sim();
        sim.send("G1 F600 X10\nY10");
        assert!(sim.run_until(SECOND, |s| s.controller().planner().iter_blocks().count() == 2));
        let blocks: Vec<_> = sim.controller().planner().iter_blocks().cloned().collect();

        let origin = [0.0; 6];
        let corner = [10.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let end = [10.0, 10.0, 0.0, 0.0, 0.0, 0.0];
        let expected = junction_velocity(
            &calculate_unit_vector(&origin, &corner),
            &calculate_unit_vector(&corner, &end),
            sim.controller().config(),
        )
        .min(600.0);
        assert!(expected < 600.0);
        assert!((blocks[1].junction_vmax - expected).abs() < 1e-9);
        assert!(blocks[1].profile.entry_velocity <= expected + 1e-9);

        assert!(sim.run_until_idle(10 * SECOND));
        let spm = steps_per_mm(&sim, 0);
        let ends = block_endpoints(sim.pins().log(), spm);
        assert_eq!(ends.len(), 2);
        assert_eq!((ends[0].1, ends[0].2), (10.0, 0.0));
        assert_eq!((ends[1].1, ends[1].2), (10.0, 10.0));
    }

    #[test]
    fn full_circle_is_split_into_chords_on_the_arc() {
        let mut sim = recording_sim();
        sim.send("G2 X0 Y0 I10 J0 F500");
        assert!(sim.run_until_idle(20 * SECOND));

        let config = sim.controller().config();
        let tolerance = config.system.chord_tolerance;
        let radius: f64 = 10.0;
        let by_time = config.system.chord_time_max * 500.0 / 60.0;
        let by_tolerance = radius * (2.0 * tolerance / radius).sqrt().sin();
        let chord_max = by_time.min(by_tolerance);
        let minimum = (std::f64::consts::TAU * radius / chord_max).ceil() as usize;

        let spm = steps_per_mm(&sim, 0);
        let ends = block_endpoints(sim.pins().log(), spm);
        assert!(ends.len() >= minimum, "{} chords, expected at least {}", ends.len(), minimum);
        for (seq, x, y) in &ends {
            let off_arc = ((x - 10.0).hypot(*y) - radius).abs();
            assert!(off_arc <= tolerance, "block {seq} ends {off_arc} mm off the arc");
        }
        assert_eq!(sim.pins().position()[0], 0);
        assert_eq!(sim.pins().position()[1], 0);
        assert_eq!(sim.acks(), vec![(None, 0)]);
    }

    #[test]
    fn dwell_holds_for_exactly_its_duration() {
        let mut sim = recording_sim();
        sim.send("G1 F600 X5\nG4 P1.0\nG1 X10");
        assert!(sim.run_until(SECOND, |s| s.controller().planner().iter_blocks().count() == 3));
        let dwell = sim
            .controller()
            .planner()
            .iter_blocks()
            .find(|b| b.kind == MoveKind::Dwell)
            .map(|b| b.seq)
            .unwrap();

        let mut dwell_ticks = 0u64;
        for _ in 0..10 * SECOND {
            if sim.controller().runtime().active_seq() == Some(dwell) {
                dwell_ticks += 1;
            }
            sim.step();
            if sim.controller().end_of_stream() && sim.controller().is_idle() {
                break;
            }
        }
        assert!(sim.controller().is_idle());
        assert_eq!(sim.controller().runtime().stats().dwell_ticks, SECOND);
        assert!(dwell_ticks.abs_diff(SECOND) <= 1, "dwelled {dwell_ticks} ticks");

        let log = sim.pins().log();
        let last_before = log.iter().filter(|r| r.seq < dwell).map(|r| r.tick).max().unwrap();
        let first_after = log.iter().filter(|r| r.seq > dwell).map(|r| r.tick).min().unwrap();
        assert!(log.iter().all(|r| r.seq != dwell));
        assert!(first_after - last_before >= SECOND);
        assert_eq!(sim.pins().position()[0], (10.0 * steps_per_mm(&sim, 0)).round() as i64);
    }

    #[test]
    fn feedhold_stops_within_the_move_and_resumes_exactly() {
        let mut sim = recording_sim();
        let spm = steps_per_mm(&sim, 0);
        let target = (10.0 * spm).round() as i64;
        sim.send("G1 F1000 X10");
        assert!(sim.run_until(10 * SECOND, |s| s.pins().position()[0] >= target / 2));
        assert_eq!(sim.controller().mode(), MachineMode::Run);

        let hold_tick = sim.tick();
        sim.signals().set(Signal::Feedhold);
        assert!(sim.run_until(5 * SECOND, |s| s.controller().mode() == MachineMode::Hold));
        assert_eq!(sim.controller().planner().hold_state(), HoldState::Held);
        let held_at = sim.pins().position()[0];
        assert!(held_at > target / 2 && held_at < target);

        // Stop from 1000 mm/min at the configured jerk, plus a segment of
        // latency and one partly executed segment.
        let jerk = sim.controller().config().jerk(millcore::Axis::X);
        let stop_minutes = 2.0 * (1000.0 / jerk).sqrt();
        let allowance = (stop_minutes * 60.0 * SECOND as f64) as u64 + 3 * 250 + 50;
        let last_step = sim.pins().log().iter().map(|r| r.tick).max().unwrap();
        assert!(last_step - hold_tick <= allowance, "{} ticks to stop", last_step - hold_tick);

        // Nothing moves while held.
        sim.run_ticks(SECOND / 2);
        assert_eq!(sim.pins().position()[0], held_at);

        sim.signals().set(Signal::CycleStart);
        assert!(sim.run_until_idle(10 * SECOND));
        assert_eq!(sim.pins().position()[0], target);
        assert_eq!(sim.pins().pulses()[0], target as u64);
        assert_eq!(sim.controller().mode(), MachineMode::Ready);
    }

    #[test]
    fn homing_finds_switch_and_backs_off() {
        let mut config = MachineConfig::default();
        config.axes.x.search_velocity = 1000.0;
        let mut sim = Simulator::new(config);
        // Switch sits 3 mm below the power-up position.
        sim.switches_mut()
            .place(millcore::Axis::X, millcore::hardware::SwitchEnd::Min, 0, -960);
        sim.send("G28.2 X0\nG0 X10");
        assert!(sim.run_until_idle(60 * SECOND));
        assert_eq!(sim.acks(), vec![(None, 0), (None, 0)]);
        assert!(sim.controller().machine().is_homed(millcore::Axis::X));
        // Backoff leaves X at travel_min + zb, then the program moves to 10.
        assert_eq!(sim.controller().machine().position()[0], 10.0);
        assert_eq!(sim.controller().runtime().position()[0], 3200);
    }

    #[test]
    fn unsupported_and_bad_lines_report_errors_in_order() {
        let mut sim = Simulator::new(MachineConfig::default());
        sim.send("N10 G0 X1\nN11 G1 X2\nN12 G38.2 Z1\nN13 X1..5\nN14 G2 X5 Y5 F100\nN15 G0 X0");
        assert!(sim.run_until_idle(10 * SECOND));
        let acks = sim.acks();
        let codes: Vec<u8> = acks.iter().map(|a| a.1).collect();
        assert_eq!(
            codes,
            vec![
                0,
                millcore::MotionError::BadNumber.code(),
                millcore::MotionError::UnsupportedCommand.code(),
                millcore::MotionError::BadNumber.code(),
                millcore::MotionError::ArcGeometry.code(),
                0,
            ]
        );
        assert_eq!(acks[0].0, Some(10));
        assert_eq!(acks[5].0, Some(15));
        assert_eq!(sim.pins().position()[0], 0);

        // Lines are refused while alarmed; the alarm itself carries its own code.
        sim.signals().set(Signal::Abort);
        assert!(sim.run_until(SECOND, |s| s.controller().mode() == MachineMode::Alarm));
        sim.send("N16 G0 X1");
        assert!(sim.run_until(SECOND, |s| s.acks().len() == 7));
        assert_eq!(sim.acks()[6], (None, millcore::MotionError::MachineAlarmed.code()));
        assert!(sim.responses().contains(&Response::Alarm {
            switch: None,
            status: millcore::MotionError::HardwareAlarm.code(),
        }));
    }

    #[test]
    fn cycle_start_in_the_stream_releases_a_program_stop() {
        let mut sim = Simulator::new(MachineConfig::default());
        let spm = steps_per_mm(&sim, 0);
        sim.send("G0 X1\nM0\n~\nG0 X2");
        assert!(sim.run_until_idle(5 * SECOND));
        assert!(!sim.controller().is_stopped());
        assert_eq!(sim.pins().position()[0], (2.0 * spm).round() as i64);
        assert_eq!(sim.acks(), vec![(None, 0); 3]);
    }

    #[test]
    fn cycle_start_sent_while_stopped_resumes_the_program() {
        let mut sim = Simulator::new(MachineConfig::default());
        let spm = steps_per_mm(&sim, 0);
        sim.send("G0 X1\nM0\nG0 X2");
        assert!(sim.run_until(5 * SECOND, |s| s.controller().is_stopped()));
        sim.run_ticks(SECOND / 2);
        assert!(sim.controller().is_stopped());
        assert_eq!(sim.pins().position()[0], spm.round() as i64);

        sim.send("~");
        assert!(sim.run_until_idle(5 * SECOND));
        assert!(!sim.controller().is_stopped());
        assert_eq!(sim.pins().position()[0], (2.0 * spm).round() as i64);
    }

    #[test]
    fn feedhold_behind_a_full_planner_still_holds() {
        let mut sim = Simulator::new(MachineConfig::default());
        let spm = steps_per_mm(&sim, 0);
        let mut program = String::new();
        for i in 1..=120 {
            program.push_str(&format!("G1 F300 X{:.1}\n", f64::from(i) * 0.5));
        }
        sim.send(&program);
        // Planner full, intake blocked with unread lines waiting.
        assert!(sim.run_until(5 * SECOND, |s| {
            s.controller().planner().is_full() && s.pins().position()[0] >= spm as i64
        }));
        assert!(!sim.controller().end_of_stream());

        sim.send("!");
        assert!(sim.run_until(2 * SECOND, |s| s.controller().mode() == MachineMode::Hold));
        assert_eq!(sim.controller().planner().hold_state(), HoldState::Held);
        let held_at = sim.pins().position()[0];
        assert!(held_at < (60.0 * spm) as i64);
        sim.run_ticks(SECOND / 2);
        assert_eq!(sim.pins().position()[0], held_at);

        sim.signals().set(Signal::CycleStart);
        assert!(sim.run_until_idle(30 * SECOND));
        assert_eq!(sim.pins().position()[0], (60.0 * spm).round() as i64);
        assert_eq!(sim.acks().len(), 120);
    }

    #[test]
    fn abort_flushes_motion_and_keeps_position() {
        let mut sim = Simulator::new(MachineConfig::default());
        let spm = steps_per_mm(&sim, 0);
        sim.send("G1 F1000 X50\nG1 X0\nG1 X20");
        assert!(sim.run_until(10 * SECOND, |s| s.pins().position()[0] >= (5.0 * spm) as i64));

        sim.send("%");
        assert!(sim.run_until(SECOND, |s| s.controller().mode() == MachineMode::Alarm));
        let ctl = sim.controller();
        assert!(ctl.runtime().is_idle());
        assert_eq!(ctl.runtime().queued(), 0);
        assert_eq!(ctl.planner().available(), PLANNER_BUFFER_SIZE);
        let stopped_at = sim.pins().position()[0];
        assert!(stopped_at > 0 && stopped_at < (50.0 * spm) as i64);
        assert_eq!(ctl.runtime().position()[0], stopped_at);
        assert!((ctl.machine().position()[0] - stopped_at as f64 / spm).abs() < 1e-9);

        sim.run_ticks(SECOND / 2);
        assert_eq!(sim.pins().position()[0], stopped_at);

        let before = sim.acks().len();
        sim.send("G0 X0");
        assert!(sim.run_until(SECOND, |s| s.acks().len() == before + 1));
        assert_eq!(sim.acks()[before], (None, millcore::MotionError::MachineAlarmed.code()));
        assert_eq!(sim.pins().position()[0], stopped_at);

        sim.send("$clear\nG0 X0");
        assert!(sim.run_until_idle(10 * SECOND));
        assert_eq!(sim.controller().mode(), MachineMode::Ready);
        assert_eq!(sim.pins().position()[0], 0);
        assert_eq!(&sim.acks()[before + 1..], &[(None, 0), (None, 0)]);
    }

    #[test]
    fn status_reports_follow_the_interval_and_mode_changes() {
        let mut config = MachineConfig::default();
        config.system.status_interval_ms = 250;
        let mut sim = Simulator::new(config);
        sim.send("G1 F1000 X50");

        let mut reports: Vec<(u64, MachineMode)> = Vec::new();
        let mut seen = 0;
        for _ in 0..10 * SECOND {
            sim.step();
            for r in &sim.responses()[seen..] {
                if let Response::Report(report) = r {
                    reports.push((sim.tick(), report.mode));
                }
            }
            seen = sim.responses().len();
            if sim.controller().is_idle() && sim.controller().mode() == MachineMode::Ready {
                break;
            }
        }
        assert!(sim.controller().is_idle());
        let elapsed_ms = sim.tick() * 1000 / SECOND;
        assert!(elapsed_ms > 2_900, "move took {elapsed_ms} ms");

        // Entering Run is reported at once, leaving it too.
        let (first_tick, first_mode) = reports[0];
        assert_eq!(first_mode, MachineMode::Run);
        assert!(first_tick <= 2 * TICKS_PER_PASS);
        assert_eq!(reports.last().map(|r| r.1), Some(MachineMode::Ready));
        assert_eq!(reports.iter().filter(|r| r.1 == MachineMode::Ready).count(), 1);

        // Heartbeats never come closer together than the interval, allowing
        // for the housekeeping clock's resolution.
        let min_gap = (250 - u64::from(RTC_PERIOD_MS)) * SECOND / 1000;
        for pair in reports.windows(2).filter(|w| w[1].1 == MachineMode::Run) {
            assert!(pair[1].0 - pair[0].0 >= min_gap, "reports {} ticks apart", pair[1].0 - pair[0].0);
        }
        assert!(reports.len() as u64 <= elapsed_ms / 250 + 2, "{} reports", reports.len());
        assert!(reports.len() as u64 >= elapsed_ms / 250 - 1, "{} reports", reports.len());
    }
}
