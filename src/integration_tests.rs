//! End-to-end scenarios against the bus simulator.
//!
//! These tests run the complete host stack (channel receive thread, DoCAN
//! transport, command objects, TLE9012 factory) with the simulated BMS
//! controller on the other end of the bus.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::channel::CanChannel;
    use crate::config::DiagConfig;
    use crate::error::DiagError;
    use crate::sim::{Responder, SimBus};
    use crate::tle9012::Tle9012;
    use crate::transport::UdsTransport;
    use crate::uds::{Iocbi, IocbiRecord, SharedCommand};

    struct Session {
        bus: Arc<SimBus>,
        channel: Arc<CanChannel>,
        transport: UdsTransport,
    }

    fn session(responder: Responder) -> Session {
        session_with(responder, false)
    }

    fn session_with(responder: Responder, with_worker: bool) -> Session {
        let cfg = DiagConfig::default();
        let bus = Arc::new(SimBus::new(&cfg, responder));
        let channel = Arc::new(CanChannel::new(bus.clone()).unwrap());
        channel.start().unwrap();
        let transport = if with_worker {
            UdsTransport::with_worker(&cfg, Arc::clone(&channel))
        } else {
            UdsTransport::new(&cfg, Arc::clone(&channel))
        };
        Session {
            bus,
            channel,
            transport,
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            self.transport.dispose();
            self.channel.join();
        }
    }

    fn typed_iocbi(cmd: Iocbi) -> (Arc<Mutex<Iocbi>>, SharedCommand) {
        let typed = Arc::new(Mutex::new(cmd));
        let dynamic: SharedCommand = typed.clone();
        (typed, dynamic)
    }

    #[test]
    fn test_iocbi_single_frame_round_trip() {
        let s = session(Box::new(|request| {
            assert_eq!(request, &[0x2F, 0xE1, 0x00, 0x03]);
            Some(vec![0x6F, 0xE1, 0x00, 0x03, 0x00, 0x01, 0x02])
        }));

        let (typed, cmd) = typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x00)));
        assert!(s.transport.execute_wait(&cmd));

        let written = s.bus.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].id, 0x18DA_0B0A);
        assert_eq!(
            written[0].data,
            vec![0x04, 0x2F, 0xE1, 0x00, 0x03, 0xCC, 0xCC, 0xCC]
        );
        assert_eq!(
            typed.lock().unwrap().record().status_record,
            vec![0x00, 0x01, 0x02]
        );
    }

    #[test]
    fn test_segmented_rx_with_flow_control() {
        // 12-byte response: FF + CF, CF gated on our flow control
        let s = session(Box::new(|_request| {
            Some(vec![0x6F, 0xE1, 0x01, 0x03, 0, 1, 2, 3, 4, 5, 6, 7])
        }));

        let (typed, cmd) = typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x01)));
        assert!(s.transport.execute_wait(&cmd));

        let written = s.bus.written_data();
        assert_eq!(written.len(), 2, "request then flow control");
        assert_eq!(written[0][0], 0x04);
        assert_eq!(
            written[1],
            vec![0x30, 0x00, 0x02, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert_eq!(
            typed.lock().unwrap().record().status_record,
            vec![0, 1, 2, 3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn test_negative_response_skips_callback() {
        let s = session(Box::new(|_request| Some(vec![0x7F, 0x2F, 0x31])));

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let (_, cmd) = typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x00)).with_callback(
            Box::new(move |_cmd| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ));

        assert!(!s.transport.execute_wait(&cmd));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_segmented_tx_frame_sequence() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let s = session(Box::new(move |request| {
            log.lock().unwrap().push(request.to_vec());
            let mut resp = vec![0x6F, request[1], request[2], request[3]];
            resp.push(request[4]);
            Some(resp)
        }));

        let option: Vec<u8> = (0..20).collect();
        let (_, cmd) = typed_iocbi(Iocbi::new(
            IocbiRecord::new(0xE1, 0x02).with_option(option.clone()),
        ));
        assert!(s.transport.execute_wait(&cmd));

        // 24-byte request: FF + 3 CFs
        let written = s.bus.written_data();
        assert_eq!(written.len(), 4);
        assert_eq!(
            written[0],
            vec![0x10, 0x18, 0x2F, 0xE1, 0x02, 0x03, option[0], option[1]]
        );
        assert_eq!(written[1][0], 0x21);
        assert_eq!(&written[1][1..], &option[2..9]);
        assert_eq!(written[2][0], 0x22);
        assert_eq!(&written[2][1..], &option[9..16]);
        assert_eq!(written[3][0], 0x23);
        assert_eq!(&written[3][1..5], &option[16..20]);
        assert_eq!(&written[3][5..], &[0xCC, 0xCC, 0xCC]);

        // The target saw one fully reassembled 24-byte request
        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 24);
    }

    #[test]
    fn test_bit_width_rejected_before_any_traffic() {
        let s = session(SimBus::echo_responder());
        let mut csc = Tle9012::new(0).unwrap();

        let result = csc.set_max_volt_drop_thd(0x40, Duration::from_secs(1));
        assert!(matches!(result, Err(DiagError::InvalidArgument(_))));
        assert!(s.bus.written().is_empty());
    }

    #[test]
    fn test_async_fire_and_forget() {
        let s = session_with(SimBus::echo_responder(), true);

        let (_, cmd) = typed_iocbi(
            Iocbi::new(IocbiRecord::new(0xE1, 0x00)).with_timeout(Duration::ZERO),
        );
        assert!(s.transport.execute(&cmd).unwrap());
        s.transport.wait_queue_complete();

        let written = s.bus.written_data();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][..5], [0x04, 0x2F, 0xE1, 0x00, 0x03]);
    }

    #[test]
    fn test_async_queue_saturation() {
        // No responses: each command blocks the worker for its timeout
        let s = session_with(Box::new(|_request| None), true);

        let slow = Duration::from_millis(400);
        let (_, first) =
            typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x00)).with_timeout(slow));
        assert!(s.transport.execute(&first).unwrap());
        // Let the worker pick it up so the queue is empty again
        std::thread::sleep(Duration::from_millis(100));

        for i in 0..16u8 {
            let (_, cmd) =
                typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, i)).with_timeout(slow));
            assert!(s.transport.execute(&cmd).unwrap(), "slot {}", i);
        }

        let (_, overflow) =
            typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x20)).with_timeout(slow));
        assert!(matches!(
            s.transport.execute(&overflow),
            Err(DiagError::QueueFull)
        ));
    }

    #[test]
    fn test_async_preserves_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let s = session_with(
            Box::new(move |request| {
                log.lock().unwrap().push(request[2]);
                None
            }),
            true,
        );

        for i in 0..5u8 {
            let (_, cmd) =
                typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, i)).with_timeout(Duration::ZERO));
            s.transport.execute(&cmd).unwrap();
        }
        s.transport.wait_queue_complete();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_rx_timeout_fails_command() {
        let s = session(Box::new(|_request| None));

        let (_, cmd) = typed_iocbi(
            Iocbi::new(IocbiRecord::new(0xE1, 0x00)).with_timeout(Duration::from_millis(100)),
        );
        assert!(!s.transport.execute_wait(&cmd));
    }

    #[test]
    fn test_duplicate_dictionary_key_rejected() {
        let s = session(SimBus::echo_responder());
        let (_, a) = typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x00)));
        let (_, b) = typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x01)));

        s.transport.add_command("CH0", a).unwrap();
        assert!(matches!(
            s.transport.add_command("CH0", b),
            Err(DiagError::InvalidArgument(_))
        ));
        assert_eq!(s.transport.command_keys(), vec!["CH0"]);
    }

    #[test]
    fn test_dictionary_iterates_in_insertion_order() {
        let s = session(SimBus::echo_responder());
        for key in ["B", "A", "C"] {
            let (_, cmd) = typed_iocbi(Iocbi::new(IocbiRecord::new(0xE1, 0x00)));
            s.transport.add_command(key, cmd).unwrap();
        }
        assert_eq!(s.transport.command_keys(), vec!["B", "A", "C"]);
    }

    #[test]
    fn test_raw_send_receive_path() {
        let s = session(SimBus::echo_responder());

        let response = s
            .transport
            .send_receive(&[0x31, 0x01, 0x02, 0x00], Duration::from_secs(1))
            .unwrap();
        assert_eq!(response, vec![0x71, 0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_factory_command_through_transport() {
        let s = session(SimBus::echo_responder());
        let mut csc = Tle9012::new(1).unwrap();

        let cmd = csc.set_cell_enable(5, 1, Duration::from_secs(1)).unwrap();
        let dynamic: SharedCommand = cmd.clone();
        assert!(s.transport.execute_wait(&dynamic));

        // Echo target returned the option record; default checks passed
        assert_eq!(cmd.lock().unwrap().record().status_record, vec![1, 5, 1]);
    }
}
