// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Laser loop firmware for RP2040.
//!
//! A polled USB device with no HAL, no interrupts and no callbacks: one
//! `main` that brings up clocks, USB and PIO0 in order, then loops over the
//! USB controller's status flags forever. Everything it serves comes from the
//! `laser_firmware` library, which is where the interesting (and tested)
//! logic lives.
//!
//! Two builds, picked by Cargo feature:
//!
//! - `variant-cdc` (default): enumerates as `ppm_loop`, a CDC serial port.
//!   Every little-endian `u32` the host writes to the bulk OUT endpoint is a
//!   pause length for the pulse generator; every sample the pulse detector
//!   measures comes back on bulk IN, also as a little-endian `u32`. Wire the
//!   pulse output pin to the pulse input pin and you have a loopback.
//!   Commands go to the generator one at a time, paced by SysTick, so the
//!   detector measures every one of them.
//!
//! - `variant-audio`: enumerates as the "Laser Sound Card" UAC2 headset.
//!   Only the control pipe is serviced; nothing streams yet.
//!
//! The PIO programs run in both builds. So does the serial number, which is
//! the flash chip's unique ID, read once at startup.
//!
//! # A note on `unsafe`
//!
//! Most `unsafe` here is `rp2040_pac` requiring it for raw register writes
//! (`w.bits(..)`), and goes without comment. The rest concerns USB DPRAM and
//! says why it's OK where it happens.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("laser-firmware only runs on RP2040; build with --target thumbv6m-none-eabi");
}

#[cfg(target_os = "none")]
mod firmware {
    use core::cell::UnsafeCell;
    use core::mem::MaybeUninit;
    use core::sync::atomic::{AtomicBool, Ordering};

    use cortex_m_rt::entry;
    use num_traits::FromPrimitive;
    use zerocopy::AsBytes;

    use panic_halt as _;

    use laser_firmware::control::{ControlIn, ControlOut, OutProgress};
    use laser_firmware::descriptors::{HexSerialNumber, SerialNumberSource, StringScratch};
    use laser_firmware::flash_id;
    use laser_firmware::pio::instr::{Instruction, JmpCondition, SetDestination};
    use laser_firmware::pio::{pulse_detect, pulse_gen, ClockDivider, Program, SmConfig};
    use laser_firmware::usb::{UsbDescType, UsbDir, UsbSetupPacket, UsbSetupRequest, UsbTransferType};

    // GPIO numbers of pins used here, other than USB. The diagnostic pins
    // follow the event flow so it can be watched on a logic analyzer.
    // `target-feather` wins over the default `target-pico`.
    cfg_if::cfg_if! {
        if #[cfg(feature = "target-feather")] {
            const LED_PIN: u8 = 13;
            const SETUP_PIN: u8 = 0;
            const BUFF_PIN: u8 = 1;
            const RESET_PIN: u8 = 2;
            const EP_PIN: [u8; 3] = [3, 4, 5];
            const PULSE_OUT_PIN: u8 = 24;
            const PULSE_IN_PIN: u8 = 25;
        } else if #[cfg(feature = "target-pico")] {
            const LED_PIN: u8 = 25; // any activity
            const SETUP_PIN: u8 = 0; // SETUP request being handled
            const BUFF_PIN: u8 = 1; // activity on a buffer
            const RESET_PIN: u8 = 2; // bus reset
            const EP_PIN: [u8; 3] = [3, 4, 5]; // activity on EP0, 1, 2
            const PULSE_OUT_PIN: u8 = 14;
            const PULSE_IN_PIN: u8 = 15;
        } else {
            compile_error!("missing or unknown target-* feature");
        }
    }

    // Which descriptor set we present. `variant-audio` wins if both are on,
    // so that it can be selected without `--no-default-features`.
    cfg_if::cfg_if! {
        if #[cfg(feature = "variant-audio")] {
            use laser_firmware::descriptors::audio::LASER_SOUND_CARD as DEVICE;

            static ENDPOINTS: &[&UsbEndpointConfiguration] = &[&EP0_OUT_CFG, &EP0_IN_CFG];
        } else if #[cfg(feature = "variant-cdc")] {
            use byteorder::{ByteOrder, LittleEndian};
            use cortex_m::peripheral::{syst::SystClkSource, SYST};
            use heapless::Deque;
            use laser_firmware::descriptors::cdc::{self, LineCoding, PPM_LOOP as DEVICE};
            use laser_firmware::pio::loopback::CommandPacer;

            static EP_NOTIFY_CFG: UsbEndpointConfiguration =
                UsbEndpointConfiguration::new(cdc::EP_NOTIFY_ADDR, UsbTransferType::Interrupt, 2);
            static EP_DATA_OUT_CFG: UsbEndpointConfiguration =
                UsbEndpointConfiguration::new(cdc::EP_DATA_OUT_ADDR, UsbTransferType::Bulk, 3);
            static EP_DATA_IN_CFG: UsbEndpointConfiguration =
                UsbEndpointConfiguration::new(cdc::EP_DATA_IN_ADDR, UsbTransferType::Bulk, 4);

            static ENDPOINTS: &[&UsbEndpointConfiguration] = &[
                &EP0_OUT_CFG,
                &EP0_IN_CFG,
                &EP_NOTIFY_CFG,
                &EP_DATA_OUT_CFG,
                &EP_DATA_IN_CFG,
            ];
        } else {
            compile_error!("missing or unknown variant-* feature");
        }
    }

    /// PIO clock divider. 1.0 runs the programs at the full 132 MHz system
    /// clock, so one generator count is about 7.6 ns.
    const PIO_CLOCK_DIVIDER: ClockDivider = ClockDivider::FULL_SPEED;

    const GENERATOR_SM: usize = 0;
    const DETECTOR_SM: usize = 1;

    #[entry]
    fn main() -> ! {
        let p = rp2040_pac::Peripherals::take().unwrap();

        //////////////////////////////////////////////////////////////////////
        // Diagnostic GPIOs.

        p.RESETS.reset.modify(|_, w| w.io_bank0().clear_bit());
        while !p.RESETS.reset_done.read().io_bank0().bit() {}

        for pin in [LED_PIN, SETUP_PIN, BUFF_PIN, RESET_PIN].into_iter().chain(EP_PIN) {
            p.IO_BANK0.gpio[pin as usize].gpio_ctrl.write(|w| w.funcsel().sio());
            p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(1 << pin) });
        }

        clocks_init(&p);

        // Before anything else could want the flash.
        let flash_unique_id = read_flash_unique_id();

        //////////////////////////////////////////////////////////////////////
        // PIO0: generator on SM0 at the bottom of instruction memory, detector
        // on SM1 right after it.

        p.RESETS.reset.modify(|_, w| w.pio0().set_bit());
        p.RESETS.reset.modify(|_, w| w.pio0().clear_bit());
        while !p.RESETS.reset_done.read().pio0().bit() {}

        p.IO_BANK0.gpio[PULSE_OUT_PIN as usize].gpio_ctrl.write(|w| w.funcsel().pio0());
        p.IO_BANK0.gpio[PULSE_IN_PIN as usize].gpio_ctrl.write(|w| w.funcsel().pio0());
        // The detector's timing assumes it sees the pin without the two-cycle
        // synchronizer delay.
        p.PIO0.input_sync_bypass.write(|w| unsafe { w.bits(1 << PULSE_IN_PIN) });

        let generator_offset = 0;
        let detector_offset = generator_offset + pulse_gen::PULSE_GENERATOR.code.len() as u8;

        let generator_config = SmConfig {
            clock_divider: PIO_CLOCK_DIVIDER,
            ..pulse_gen::config(generator_offset, PULSE_OUT_PIN).unwrap()
        };
        pio_load(&p.PIO0, &pulse_gen::PULSE_GENERATOR, generator_offset);
        pio_configure(&p.PIO0, GENERATOR_SM, &generator_config);
        // Claim the output pin. Mandatory side-set means the word needs a
        // side value too; low is what we want anyway.
        let side_set = pulse_gen::PULSE_GENERATOR.side_set;
        pio_exec(
            &p.PIO0,
            GENERATOR_SM,
            Instruction::Set {
                destination: SetDestination::PinDirs,
                data: 1,
            }
            .encode(side_set, Some(0), 0),
        );
        pio_exec(
            &p.PIO0,
            GENERATOR_SM,
            Instruction::Jmp {
                condition: JmpCondition::Always,
                address: generator_offset,
            }
            .encode(side_set, Some(0), 0),
        );

        let detector_config = SmConfig {
            clock_divider: PIO_CLOCK_DIVIDER,
            ..pulse_detect::config(detector_offset, PULSE_IN_PIN).unwrap()
        };
        pio_load(&p.PIO0, &pulse_detect::PULSE_DETECTOR, detector_offset);
        pio_configure(&p.PIO0, DETECTOR_SM, &detector_config);
        pio_exec(
            &p.PIO0,
            DETECTOR_SM,
            Instruction::Jmp {
                condition: JmpCondition::Always,
                address: detector_offset,
            }
            .plain(),
        );

        // CTRL: CLKDIV_RESTART 11:8, SM_RESTART 7:4, SM_ENABLE 3:0.
        let both: u32 = 1 << GENERATOR_SM | 1 << DETECTOR_SM;
        p.PIO0.ctrl.write(|w| unsafe { w.bits(both << 8 | both << 4) });
        p.PIO0.ctrl.write(|w| unsafe { w.bits(both) });

        //////////////////////////////////////////////////////////////////////
        // USB.

        usb_init(&p);
        let buffers = take_buffers();

        for ep in ENDPOINTS {
            // EP0 is hardwired; only the others have an endpoint control
            // register.
            if let Some(epci) = ep.endpoint_control_index {
                // The peripheral wants the buffer's offset from the base of
                // DPRAM, which must fit in 16 bits. If it doesn't, something
                // is wrong with the linker script and we'd rather stop here.
                let buf_base = buffers.get(ep.data_buffer_index) as *const _ as u32;
                let dpram_base = rp2040_pac::USBCTRL_DPRAM::ptr() as u32;
                let dpram_offset = u16::try_from(buf_base - dpram_base).unwrap();

                p.USBCTRL_DPRAM.ep_control[epci].write(|w| unsafe {
                    w.enable().set_bit()
                        .interrupt_per_buff().set_bit()
                        .endpoint_type().bits(ep.transfer_type as u8)
                        .buffer_address().bits(dpram_offset)
                });
            }
        }

        #[cfg(not(feature = "variant-audio"))]
        let mut clock = CycleClock::start(cortex_m::Peripherals::take().unwrap().SYST);

        // Pull up DP. The host sees us from here on.
        p.USBCTRL_REGS.sie_ctrl.modify(|_, w| w.pullup_en().set_bit());

        //////////////////////////////////////////////////////////////////////
        // Main loop.

        // SET_ADDRESS is acknowledged at the old address, so the new one is
        // held here until the status stage has gone out.
        let mut new_address = None;
        // Only the CDC bridge waits on this.
        #[cfg_attr(feature = "variant-audio", allow(unused_assignments, unused_variables))]
        let mut configured = false;
        let mut control_in = ControlIn::new();
        let mut control_out = ControlOut::new();
        let mut scratch = StringScratch::new();
        // No usable ID means an empty serial number string.
        let mut serial = |out: &mut [zerocopy::U16<byteorder::LittleEndian>]| match flash_unique_id {
            Some(bytes) => HexSerialNumber { bytes }.read_serial(out),
            None => 0,
        };
        #[cfg(not(feature = "variant-audio"))]
        let mut bridge = Bridge::new();

        loop {
            let ints = p.USBCTRL_REGS.ints.read();

            if ints.setup_req().bit() {
                raise_pin(&p.SIO, LED_PIN);
                raise_pin(&p.SIO, SETUP_PIN);

                p.USBCTRL_REGS.sie_status.write(|w| w.setup_rec().set_bit());

                // The PAC models the setup packet as two 32-bit registers.
                let mut setup_packet = [0; 8];
                setup_packet[..4].copy_from_slice(&p.USBCTRL_DPRAM.setup_packet_low.read().bits().to_le_bytes());
                setup_packet[4..].copy_from_slice(&p.USBCTRL_DPRAM.setup_packet_high.read().bits().to_le_bytes());
                let setup = zerocopy::LayoutVerified::<_, UsbSetupPacket>::new(&setup_packet[..])
                    .unwrap()
                    .into_ref();

                // A new SETUP abandons whatever data stage was in progress,
                // and the first data packet of the new one, in either
                // direction, is DATA1. So is the status stage.
                control_in.clear();
                control_out.clear();
                EP0_IN_CFG.next_pid_1.store(true, Ordering::Relaxed);
                EP0_OUT_CFG.next_pid_1.store(true, Ordering::Relaxed);

                let reqty = UsbDir::from_u8(setup.request_type & 0x80);
                let req = UsbSetupRequest::from_u8(setup.request);
                match (reqty, req) {
                    (Some(UsbDir::Out), Some(UsbSetupRequest::SetAddress)) => {
                        new_address = Some(setup.value.get() as u8);
                        usb_acknowledge_out_request(&p.USBCTRL_DPRAM, &buffers);
                    }
                    (Some(UsbDir::Out), Some(UsbSetupRequest::SetConfiguration)) => {
                        configured = setup.value.get() != 0;
                        reset_data_toggles();
                        usb_acknowledge_out_request(&p.USBCTRL_DPRAM, &buffers);
                    }
                    (Some(UsbDir::Out), _) => {
                        // Anything else host-to-device (CDC line coding and
                        // control line state, audio controls) is accepted.
                        // With a data stage, the status goes out once the
                        // data is in.
                        match control_out.start(setup.request_type, setup.request, setup.length.get()) {
                            Some(len) => usb_start_rx(&p.USBCTRL_DPRAM, &EP0_OUT_CFG, len),
                            None => usb_acknowledge_out_request(&p.USBCTRL_DPRAM, &buffers),
                        }
                    }
                    (Some(UsbDir::In), Some(UsbSetupRequest::GetDescriptor)) => {
                        let requested = setup.length.get();
                        let index = (setup.value.get() & 0xFF) as u8;
                        match UsbDescType::from_u16(setup.value.get() >> 8) {
                            Some(UsbDescType::Device) => {
                                stage(&mut control_in, DEVICE.device_descriptor(), requested);
                            }
                            Some(UsbDescType::Config) => {
                                stage(&mut control_in, DEVICE.configuration_descriptor(index), requested);
                            }
                            Some(UsbDescType::String) => {
                                let language = setup.index.get();
                                match DEVICE.string_descriptor(index, language, &mut scratch, &mut serial) {
                                    Some(units) => stage(&mut control_in, units.as_bytes(), requested),
                                    None => {
                                        log::debug!("no string {}", index);
                                        usb_stall_ep0(&p);
                                    }
                                }
                            }
                            Some(UsbDescType::DeviceQualifier) => {
                                stage(&mut control_in, DEVICE.device_qualifier(), requested);
                            }
                            _ => {
                                // Interface and endpoint descriptors all went
                                // out with the configuration.
                                log::debug!("unsupported descriptor request {:#06x}", setup.value.get());
                                usb_stall_ep0(&p);
                            }
                        }
                        if let Some(chunk) = control_in.next_chunk() {
                            usb_start_tx(&p.USBCTRL_DPRAM, &buffers, &EP0_IN_CFG, chunk);
                        }
                    }
                    #[cfg(not(feature = "variant-audio"))]
                    (Some(UsbDir::In), _)
                        if setup.request_type & REQUEST_TYPE_MASK == REQUEST_TYPE_CLASS
                            && setup.request == cdc::GET_LINE_CODING =>
                    {
                        stage(&mut control_in, bridge.line_coding.as_bytes(), setup.length.get());
                        if let Some(chunk) = control_in.next_chunk() {
                            usb_start_tx(&p.USBCTRL_DPRAM, &buffers, &EP0_IN_CFG, chunk);
                        }
                    }
                    (Some(UsbDir::In), _) => {
                        log::debug!("unsupported request {:#04x}/{:#04x}", setup.request_type, setup.request);
                        usb_stall_ep0(&p);
                    }
                    _ => {}
                }
                lower_pin(&p.SIO, SETUP_PIN);
            }

            if ints.buff_status().bit() {
                raise_pin(&p.SIO, LED_PIN);
                raise_pin(&p.SIO, BUFF_PIN);

                let orig_bufbits = p.USBCTRL_REGS.buff_status.read().bits();
                let mut bufbits = orig_bufbits;

                while bufbits != 0 {
                    let lowbit_index = bufbits.trailing_zeros();
                    bufbits ^= 1 << lowbit_index;

                    // buff_status has one bit per buffer control register, in
                    // the same order: EP0 IN, EP0 OUT, EP1 IN, ...
                    let epnum = (lowbit_index >> 1) as usize;
                    let ep = match ENDPOINTS
                        .iter()
                        .find(|ep| ep.buffer_control_index == lowbit_index as usize)
                    {
                        Some(ep) => ep,
                        None => {
                            log::warn!("buffer event for unconfigured endpoint {}", lowbit_index);
                            continue;
                        }
                    };

                    if let Some(&pin) = EP_PIN.get(epnum) {
                        raise_pin(&p.SIO, pin);
                    }

                    let bc = p.USBCTRL_DPRAM.ep_buffer_control[ep.buffer_control_index].read();
                    // The hardware clears AVAILABLE when it hands the buffer
                    // back. Until it does, we mustn't look.
                    assert!(!bc.available_0().bit());
                    let len = bc.length_0().bits() as usize;
                    let epbuffer = buffers.get(ep.data_buffer_index).get() as *const u8;
                    // Safety: each endpoint uses its own data buffer (EP0 IN
                    // and OUT share one, but never at the same time), and
                    // AVAILABLE is clear, so the hardware isn't writing it.
                    let data = unsafe { core::slice::from_raw_parts(epbuffer, len) };

                    match ep.address {
                        EP0_IN_ADDR => {
                            if let Some(a) = new_address.take() {
                                // Status stage of SET_ADDRESS is done.
                                p.USBCTRL_REGS.addr_endp.write(|w| unsafe { w.address().bits(a) });
                            } else if let Some(chunk) = control_in.next_chunk() {
                                usb_start_tx(&p.USBCTRL_DPRAM, &buffers, &EP0_IN_CFG, chunk);
                            } else {
                                // Data stage done; the host follows with a
                                // zero-length OUT as status.
                                usb_start_rx(&p.USBCTRL_DPRAM, &EP0_OUT_CFG, 0);
                            }
                        }
                        EP0_OUT_ADDR if control_out.is_active() => match control_out.receive(data) {
                            OutProgress::More(len) => usb_start_rx(&p.USBCTRL_DPRAM, &EP0_OUT_CFG, len),
                            OutProgress::Done => {
                                #[cfg(not(feature = "variant-audio"))]
                                bridge.control_out(&control_out);
                                usb_acknowledge_out_request(&p.USBCTRL_DPRAM, &buffers);
                            }
                        },
                        #[cfg(not(feature = "variant-audio"))]
                        cdc::EP_DATA_OUT_ADDR => bridge.receive(data),
                        #[cfg(not(feature = "variant-audio"))]
                        cdc::EP_DATA_IN_ADDR => bridge.in_busy = false,
                        // Including EP0 OUT as the status stage of an IN
                        // transfer.
                        _ => {}
                    }

                    if let Some(&pin) = EP_PIN.get(epnum) {
                        lower_pin(&p.SIO, pin);
                    }
                }
                p.USBCTRL_REGS.buff_status.write(|w| unsafe { w.bits(orig_bufbits) });

                lower_pin(&p.SIO, BUFF_PIN);
            }

            if ints.bus_reset().bit() {
                raise_pin(&p.SIO, LED_PIN);
                raise_pin(&p.SIO, RESET_PIN);
                p.USBCTRL_REGS.sie_status.write(|w| w.bus_reset().set_bit());

                new_address = None;
                configured = false;
                control_in.clear();
                control_out.clear();
                reset_data_toggles();
                #[cfg(not(feature = "variant-audio"))]
                bridge.reset();
                p.USBCTRL_REGS.addr_endp.write(|w| unsafe { w.address().bits(0) });

                lower_pin(&p.SIO, RESET_PIN);
            }

            #[cfg(not(feature = "variant-audio"))]
            bridge.pump(configured, clock.now(), &p, &buffers);

            lower_pin(&p.SIO, LED_PIN);
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Bring-up.

    /// Moves from the ring oscillator to the 12 MHz crystal, runs the system
    /// clock from PLL_SYS at 132 MHz and the USB clock from PLL_USB at
    /// 48 MHz.
    fn clocks_init(p: &rp2040_pac::Peripherals) {
        p.XOSC.ctrl.write(|w| unsafe { w.bits(0xfab_aa0) });
        while !p.XOSC.status.read().stable().bit() {}
        p.CLOCKS.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
        while p.CLOCKS.clk_ref_selected.read().bits() != (1 << 2) {}
        // ROSC off.
        p.ROSC.ctrl.write(|w| unsafe { w.bits(0xd1e_fa4) });

        // PLL_SYS: 12 MHz * 132 = 1584 MHz VCO, / (6 * 2) = 132 MHz.
        p.RESETS.reset.modify(|_, w| w.pll_sys().clear_bit());
        while !p.RESETS.reset_done.read().pll_sys().bit() {}
        p.PLL_SYS.cs.write(|w| unsafe { w.refdiv().bits(1) });
        p.PLL_SYS.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(132) });
        p.PLL_SYS.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
        while !p.PLL_SYS.cs.read().lock().bit() {}
        p.PLL_SYS.prim.write(|w| unsafe { w.postdiv1().bits(6).postdiv2().bits(2) });
        p.PLL_SYS.pwr.modify(|_, w| w.postdivpd().clear_bit());

        p.CLOCKS.clk_sys_ctrl.write(|w| w.auxsrc().clksrc_pll_sys());
        p.CLOCKS.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());
        while p.CLOCKS.clk_sys_selected.read().bits() != (1 << 1) {}

        p.CLOCKS.clk_peri_ctrl.write(|w| w.auxsrc().clk_sys().enable().set_bit());

        // PLL_USB: 12 MHz * 100 = 1200 MHz VCO, / (5 * 5) = 48 MHz.
        p.RESETS.reset.modify(|_, w| w.pll_usb().clear_bit());
        while !p.RESETS.reset_done.read().pll_usb().bit() {}
        p.PLL_USB.cs.write(|w| unsafe { w.refdiv().bits(1) });
        p.PLL_USB.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(100) });
        p.PLL_USB.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
        while !p.PLL_USB.cs.read().lock().bit() {}
        p.PLL_USB.prim.write(|w| unsafe { w.postdiv1().bits(5).postdiv2().bits(5) });
        p.PLL_USB.pwr.modify(|_, w| w.postdivpd().clear_bit());

        p.CLOCKS.clk_usb_ctrl.write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());
    }

    /// Resets the controller and sets it up as a device on the onboard PHY,
    /// with status flags for the events the main loop polls. Leaves the
    /// pullup off.
    fn usb_init(p: &rp2040_pac::Peripherals) {
        p.RESETS.reset.modify(|_, w| w.usbctrl().set_bit());
        p.RESETS.reset.modify(|_, w| w.usbctrl().clear_bit());
        while !p.RESETS.reset_done.read().usbctrl().bit() {}

        p.USBCTRL_DPRAM.setup_packet_low.write(|w| unsafe { w.bits(0) });
        p.USBCTRL_DPRAM.setup_packet_high.write(|w| unsafe { w.bits(0) });
        for epc in &p.USBCTRL_DPRAM.ep_control {
            epc.write(|w| unsafe { w.bits(0) });
        }
        for epb in &p.USBCTRL_DPRAM.ep_buffer_control {
            epb.write(|w| unsafe { w.bits(0) });
        }

        p.USBCTRL_REGS.usb_muxing.write(|w| w.to_phy().set_bit().softcon().set_bit());
        // Not every board wires VBUS detect. Pretend it's always there.
        p.USBCTRL_REGS.usb_pwr.write(|w| w.vbus_detect().set_bit()
            .vbus_detect_override_en().set_bit()
        );
        p.USBCTRL_REGS.main_ctrl.write(|w| w
            .controller_en().set_bit()
            .host_ndevice().clear_bit()
        );
        p.USBCTRL_REGS.sie_ctrl.write(|w| w.ep0_int_1buf().set_bit());
        p.USBCTRL_REGS.inte.write(|w| w
            .buff_status().set_bit()
            .bus_reset().set_bit()
            .setup_req().set_bit()
        );
    }

    /// Claims the USB DPRAM buffers. Must be called once.
    fn take_buffers() -> Buffers {
        // These land in DPRAM through the linker script. The startup code
        // doesn't touch that memory, hence `MaybeUninit`; both we and the
        // hardware write them through shared references, hence `UnsafeCell`.
        #[link_section = ".usb_ep0_buffer0"]
        #[used]
        static mut USB_EP0_BUFFER0: MaybeUninit<UnsafeCell<[u8; 64]>> = MaybeUninit::uninit();

        #[link_section = ".usb_ep0_buffer1"]
        #[used]
        static mut USB_EP0_BUFFER1: MaybeUninit<UnsafeCell<[u8; 64]>> = MaybeUninit::uninit();

        #[link_section = ".usb_buffers"]
        #[used]
        static mut USB_BUFFERS: [MaybeUninit<UnsafeCell<[u8; 64]>>; DATA_BUFFERS] = {
            const UNINIT: MaybeUninit<UnsafeCell<[u8; 64]>> = MaybeUninit::uninit();
            [UNINIT; DATA_BUFFERS]
        };

        // Safety: `main` calls this once, before any endpoint points at these
        // buffers, so these references are unique and nobody else is looking.
        let ep0_buffer0 = unsafe { &mut USB_EP0_BUFFER0 };
        let ep0_buffer1 = unsafe { &mut USB_EP0_BUFFER1 };
        let rest = unsafe { &mut USB_BUFFERS };

        *ep0_buffer0 = MaybeUninit::new(UnsafeCell::new([0; 64]));
        *ep0_buffer1 = MaybeUninit::new(UnsafeCell::new([0; 64]));
        for b in &mut *rest {
            *b = MaybeUninit::new(UnsafeCell::new([0; 64]));
        }

        // Safety: all initialized just above. The array cast is
        // `MaybeUninit<T>` -> `T`, which have the same layout.
        Buffers {
            ep0_buffer0: unsafe { ep0_buffer0.assume_init_ref() },
            ep0_buffer1: unsafe { ep0_buffer1.assume_init_ref() },
            rest: unsafe { &*(rest as *const _ as *const _) },
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // PIO.

    /// Writes `program` into PIO instruction memory at `offset`.
    fn pio_load(pio: &rp2040_pac::PIO0, program: &Program, offset: u8) {
        let words = match program.relocated(offset) {
            Ok(words) => words,
            Err(e) => panic!("{}", e),
        };
        for (i, word) in words.enumerate() {
            pio.instr_mem[usize::from(offset) + i].write(|w| unsafe { w.bits(u32::from(word)) });
        }
    }

    fn pio_configure(pio: &rp2040_pac::PIO0, sm: usize, config: &SmConfig) {
        let regs = &pio.sm[sm];
        regs.sm_clkdiv.write(|w| unsafe { w.bits(config.clkdiv_bits()) });
        regs.sm_execctrl.write(|w| unsafe { w.bits(config.execctrl_bits()) });
        regs.sm_shiftctrl.write(|w| unsafe { w.bits(config.shiftctrl_bits()) });
        regs.sm_pinctrl.write(|w| unsafe { w.bits(config.pinctrl_bits()) });
    }

    /// Executes one instruction on `sm` immediately.
    fn pio_exec(pio: &rp2040_pac::PIO0, sm: usize, instruction: u16) {
        pio.sm[sm].sm_instr.write(|w| unsafe { w.bits(u32::from(instruction)) });
    }

    // FSTAT fields, one bit per state machine.
    #[cfg(not(feature = "variant-audio"))]
    const FSTAT_TXFULL_SHIFT: usize = 16;
    #[cfg(not(feature = "variant-audio"))]
    const FSTAT_RXEMPTY_SHIFT: usize = 8;

    #[cfg(not(feature = "variant-audio"))]
    fn pio_tx_full(pio: &rp2040_pac::PIO0, sm: usize) -> bool {
        pio.fstat.read().bits() & 1 << (FSTAT_TXFULL_SHIFT + sm) != 0
    }

    #[cfg(not(feature = "variant-audio"))]
    fn pio_rx_empty(pio: &rp2040_pac::PIO0, sm: usize) -> bool {
        pio.fstat.read().bits() & 1 << (FSTAT_RXEMPTY_SHIFT + sm) != 0
    }

    //////////////////////////////////////////////////////////////////////////
    // Flash unique ID.
    //
    // The flash chip can't answer commands while we execute from it, so the
    // transfer itself runs from RAM with XIP off. It gets there through the
    // boot ROM's flash routines, and puts XIP back by rerunning the
    // second-stage bootloader from a RAM copy.

    // XIP_SSI registers.
    const SSI_SR: *const u32 = 0x1800_0028 as *const u32;
    const SSI_DR0: *mut u32 = 0x1800_0060 as *mut u32;
    const SSI_SR_TFNF: u32 = 1 << 1;
    const SSI_SR_RFNE: u32 = 1 << 3;

    // IO_QSPI GPIO_QSPI_SS_CTRL, and its OUTOVER field.
    const QSPI_SS_CTRL: *mut u32 = 0x4001_800c as *mut u32;
    const QSPI_SS_OUTOVER_MASK: u32 = 0b11 << 8;
    const QSPI_SS_OUTOVER_LOW: u32 = 0b10 << 8;
    const QSPI_SS_OUTOVER_HIGH: u32 = 0b11 << 8;

    type RomFn = unsafe extern "C" fn();

    struct FlashRom {
        connect_internal_flash: RomFn,
        flash_exit_xip: RomFn,
        flash_flush_cache: RomFn,
        /// The RAM copy of BOOT2, Thumb bit set.
        restore_xip: RomFn,
    }

    /// Looks up a boot ROM function by its two-letter code.
    fn rom_func(code: u32) -> Option<RomFn> {
        type Lookup = unsafe extern "C" fn(*const u16, u32) -> usize;
        // Safety: the ROM keeps these two halfword pointers at fixed
        // addresses on every RP2040, and the lookup is a plain function.
        unsafe {
            let table = core::ptr::read_volatile(flash_id::rom::FUNC_TABLE_PTR as *const u16) as usize;
            let lookup = core::ptr::read_volatile(flash_id::rom::TABLE_LOOKUP_PTR as *const u16) as usize;
            let lookup: Lookup = core::mem::transmute(lookup);
            match lookup(table as *const u16, code) {
                0 => None,
                f => Some(core::mem::transmute::<usize, RomFn>(f)),
            }
        }
    }

    /// Reads the flash chip's 64-bit unique ID, or `None` if it doesn't seem
    /// to have one.
    fn read_flash_unique_id() -> Option<[u8; flash_id::UNIQUE_ID_BYTES]> {
        // BOOT2 won't run from flash while it's reconfiguring flash access.
        static mut BOOT2_RAM: [u32; 64] = [0; 64];
        // Safety: only touched here, once, before anything runs from it.
        let boot2_ram = unsafe { &mut BOOT2_RAM };
        for (word, bytes) in boot2_ram.iter_mut().zip(BOOT2.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        // Safety: a copy of a Thumb routine that returns when called.
        let restore_xip = unsafe { core::mem::transmute::<usize, RomFn>(boot2_ram.as_ptr() as usize + 1) };

        let rom = match (
            rom_func(flash_id::rom::CONNECT_INTERNAL_FLASH),
            rom_func(flash_id::rom::FLASH_EXIT_XIP),
            rom_func(flash_id::rom::FLASH_FLUSH_CACHE),
        ) {
            (Some(connect_internal_flash), Some(flash_exit_xip), Some(flash_flush_cache)) => FlashRom {
                connect_internal_flash,
                flash_exit_xip,
                flash_flush_cache,
                restore_xip,
            },
            _ => {
                log::warn!("boot ROM flash routines missing");
                return None;
            }
        };

        let mut jedec = flash_id::jedec_id_frame();
        // Safety: nothing else uses the flash, and no interrupts are enabled
        // that could run code from it in the meantime.
        unsafe { flash_transfer(&rom, jedec.as_mut_ptr(), jedec.len()) };
        log::info!("flash JEDEC ID {:#08x}", flash_id::jedec_id(&jedec));

        let mut frame = flash_id::unique_id_frame();
        // Safety: as above.
        unsafe { flash_transfer(&rom, frame.as_mut_ptr(), frame.len()) };
        let id = flash_id::unique_id(&frame);
        if flash_id::is_plausible(&id) {
            log::info!("flash unique ID {:02x?}", id);
            Some(id)
        } else {
            log::warn!("flash has no unique ID");
            None
        }
    }

    /// Clocks `len` bytes at `frame` out to the flash chip, replacing them
    /// with what came back.
    ///
    /// Safety: must not be interrupted by anything running from flash.
    /// Everything in here, and everything it calls, is in RAM or ROM.
    #[inline(never)]
    #[link_section = ".data.ram_func"]
    unsafe fn flash_transfer(rom: &FlashRom, frame: *mut u8, len: usize) {
        (rom.connect_internal_flash)();
        (rom.flash_exit_xip)();

        let ss = core::ptr::read_volatile(QSPI_SS_CTRL) & !QSPI_SS_OUTOVER_MASK;
        core::ptr::write_volatile(QSPI_SS_CTRL, ss | QSPI_SS_OUTOVER_LOW);

        let mut tx = 0;
        let mut rx = 0;
        while rx < len {
            let sr = core::ptr::read_volatile(SSI_SR);
            if sr & SSI_SR_TFNF != 0 && tx < len && tx - rx < flash_id::MAX_IN_FLIGHT {
                core::ptr::write_volatile(SSI_DR0, u32::from(*frame.add(tx)));
                tx += 1;
            }
            if sr & SSI_SR_RFNE != 0 {
                *frame.add(rx) = core::ptr::read_volatile(SSI_DR0) as u8;
                rx += 1;
            }
        }

        core::ptr::write_volatile(QSPI_SS_CTRL, ss | QSPI_SS_OUTOVER_HIGH);

        (rom.flash_flush_cache)();
        (rom.restore_xip)();
    }

    //////////////////////////////////////////////////////////////////////////
    // CDC <-> PIO bridge.

    /// Most commands (or samples) one 64-byte bulk packet carries.
    #[cfg(not(feature = "variant-audio"))]
    const WORDS_PER_PACKET: usize = 16;

    #[cfg(not(feature = "variant-audio"))]
    struct Bridge {
        /// Commands from the last OUT packet not yet in the generator FIFO.
        /// The OUT endpoint stays unarmed until this drains, so the host is
        /// NAKed rather than having commands dropped.
        pending: Deque<u32, WORDS_PER_PACKET>,
        /// Samples out of the detector, waiting for bulk IN.
        samples: Deque<u32, WORDS_PER_PACKET>,
        pacer: CommandPacer,
        /// What the host last set. Only reported back; the loop has no UART
        /// to apply it to.
        line_coding: LineCoding,
        out_armed: bool,
        in_busy: bool,
    }

    #[cfg(not(feature = "variant-audio"))]
    impl Bridge {
        const fn new() -> Self {
            Self {
                pending: Deque::new(),
                samples: Deque::new(),
                pacer: CommandPacer::new(0),
                line_coding: LineCoding::DEFAULT,
                out_armed: false,
                in_busy: false,
            }
        }

        fn reset(&mut self) {
            *self = Self::new();
        }

        /// Takes a packet that arrived on bulk OUT.
        fn receive(&mut self, data: &[u8]) {
            self.out_armed = false;
            let words = data.chunks_exact(4);
            if !words.remainder().is_empty() {
                log::warn!("ignoring {} trailing bytes", words.remainder().len());
            }
            for word in words {
                let n = LittleEndian::read_u32(word);
                if self.pending.push_back(n).is_err() {
                    log::warn!("command queue full, dropped {}", n);
                }
            }
        }

        /// Handles the end of a class OUT request's data stage.
        fn control_out(&mut self, request: &ControlOut) {
            if request.request_type() & REQUEST_TYPE_MASK != REQUEST_TYPE_CLASS
                || request.request() != cdc::SET_LINE_CODING
            {
                return;
            }
            match LineCoding::parse(request.data()) {
                Some(coding) => {
                    log::debug!("line coding {} baud", coding.dte_rate.get());
                    self.line_coding = coding;
                }
                None => log::warn!("short line coding, {} bytes", request.data().len()),
            }
        }

        /// Moves commands into the generator and samples out of the detector,
        /// as far as FIFOs, endpoints and the pacer allow. Idle until
        /// configured. `now` is in PIO cycles.
        fn pump(&mut self, configured: bool, now: u64, p: &rp2040_pac::Peripherals, buffers: &Buffers) {
            if !configured {
                return;
            }
            while !self.samples.is_full() && !pio_rx_empty(&p.PIO0, DETECTOR_SM) {
                let sample = p.PIO0.rxf[DETECTOR_SM].read().bits();
                // Can't fail: checked for room.
                let _ = self.samples.push_back(sample);
                self.pacer.sample_arrived(now);
            }

            // Nothing goes out while there's no room for what comes back.
            if let Some(&n) = self.pending.front() {
                if !self.samples.is_full() && !pio_tx_full(&p.PIO0, GENERATOR_SM) && self.pacer.ready(now) {
                    p.PIO0.txf[GENERATOR_SM].write(|w| unsafe { w.bits(n) });
                    self.pending.pop_front();
                    self.pacer.sent(n, now);
                }
            }
            if self.pending.is_empty() && !self.out_armed {
                usb_start_rx(&p.USBCTRL_DPRAM, &EP_DATA_OUT_CFG, WORDS_PER_PACKET * 4);
                self.out_armed = true;
            }

            if !self.in_busy && !self.samples.is_empty() {
                let mut packet = [0u8; WORDS_PER_PACKET * 4];
                let mut len = 0;
                while let Some(sample) = self.samples.pop_front() {
                    LittleEndian::write_u32(&mut packet[len..len + 4], sample);
                    len += 4;
                }
                usb_start_tx(&p.USBCTRL_DPRAM, buffers, &EP_DATA_IN_CFG, &packet[..len]);
                self.in_busy = true;
            }
        }
    }

    /// SysTick's counter is 24 bits wide.
    #[cfg(not(feature = "variant-audio"))]
    const SYST_RELOAD: u32 = 0x00FF_FFFF;

    /// Core clock cycles since startup, from SysTick. With the PIO clock
    /// divider at 1 these are PIO cycles too. `now` must be called at least
    /// once per SysTick wrap, about 127 ms at 132 MHz; the main loop does.
    #[cfg(not(feature = "variant-audio"))]
    struct CycleClock {
        last: u32,
        now: u64,
    }

    #[cfg(not(feature = "variant-audio"))]
    impl CycleClock {
        fn start(mut syst: SYST) -> Self {
            syst.set_clock_source(SystClkSource::Core);
            syst.set_reload(SYST_RELOAD);
            syst.clear_current();
            syst.enable_counter();
            Self {
                last: SYST::get_current(),
                now: 0,
            }
        }

        fn now(&mut self) -> u64 {
            // SysTick counts down.
            let current = SYST::get_current();
            self.now += u64::from(self.last.wrapping_sub(current) & SYST_RELOAD);
            self.last = current;
            self.now
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // USB support.

    fn stage(control_in: &mut ControlIn, bytes: &[u8], requested: u16) {
        if let Err(e) = control_in.start(bytes, requested) {
            log::warn!("control IN of {} bytes too large", e.0);
        }
    }

    // bmRequestType bits 6:5.
    #[cfg(not(feature = "variant-audio"))]
    const REQUEST_TYPE_MASK: u8 = 0x60;
    #[cfg(not(feature = "variant-audio"))]
    const REQUEST_TYPE_CLASS: u8 = 0x20;

    // EP_STALL_ARM bits, and STALL in a buffer control register.
    const EP_STALL_ARM_EP0_IN: u32 = 1 << 0;
    const EP_STALL_ARM_EP0_OUT: u32 = 1 << 1;
    const BUFFER_CONTROL_STALL: u32 = 1 << 11;

    /// Refuses the current control request. Both halves of EP0 answer STALL
    /// until the next SETUP, which clears the arming; the next transfer
    /// rewrites buffer control.
    fn usb_stall_ep0(p: &rp2040_pac::Peripherals) {
        p.USBCTRL_REGS.ep_stall_arm.write(|w| unsafe { w.bits(EP_STALL_ARM_EP0_IN | EP_STALL_ARM_EP0_OUT) });
        for ep in [&EP0_IN_CFG, &EP0_OUT_CFG] {
            p.USBCTRL_DPRAM.ep_buffer_control[ep.buffer_control_index]
                .write(|w| unsafe { w.bits(BUFFER_CONTROL_STALL) });
        }
    }

    /// Queues a zero-length IN on EP0: the status stage of a control OUT.
    fn usb_acknowledge_out_request(
        usb_dp_regs: &rp2040_pac::USBCTRL_DPRAM,
        ep_buffers: &Buffers,
    ) {
        usb_start_tx(usb_dp_regs, ep_buffers, &EP0_IN_CFG, &[]);
    }

    /// Copies `buffer` into `ep`'s DPRAM buffer and hands it to the hardware
    /// to send on the host's next IN.
    fn usb_start_tx(
        usb_dp_regs: &rp2040_pac::USBCTRL_DPRAM,
        ep_buffers: &Buffers,
        ep: &UsbEndpointConfiguration,
        buffer: &[u8],
    ) {
        assert!(buffer.len() <= 64);
        assert!(UsbDir::of_endpoint_addr(ep.address) == UsbDir::In);

        let epbuffer = ep_buffers.get(ep.data_buffer_index).get() as *mut u8;
        // Safety: the buffer isn't AVAILABLE (we're the one about to make it
        // so), and no reference into it outlives this call.
        unsafe {
            epbuffer.copy_from_nonoverlapping(buffer.as_ptr(), buffer.len());
        }

        let np = ep.next_pid_1.load(Ordering::Relaxed);
        usb_dp_regs.ep_buffer_control[ep.buffer_control_index].write(|w| unsafe {
            w.pid_0().bit(np)
                .full_0().set_bit()
                .available_0().set_bit()
                .length_0().bits(buffer.len() as u16)
        });
        ep.next_pid_1.store(!np, Ordering::Relaxed);
    }

    /// Lets the host send up to `len` bytes to `ep`.
    fn usb_start_rx(
        usb_dp_regs: &rp2040_pac::USBCTRL_DPRAM,
        ep: &UsbEndpointConfiguration,
        len: usize,
    ) {
        assert!(len <= 64);
        assert!(UsbDir::of_endpoint_addr(ep.address) == UsbDir::Out);

        let np = ep.next_pid_1.load(Ordering::Relaxed);
        usb_dp_regs.ep_buffer_control[ep.buffer_control_index].write(|w| unsafe {
            w.pid_0().bit(np)
                .full_0().clear_bit()
                .available_0().set_bit()
                .length_0().bits(len as u16)
        });
        ep.next_pid_1.store(!np, Ordering::Relaxed);
    }

    /// After a bus reset or SET_CONFIGURATION every non-control endpoint
    /// starts over at DATA0.
    fn reset_data_toggles() {
        for ep in ENDPOINTS {
            if ep.endpoint_control_index.is_some() {
                ep.next_pid_1.store(false, Ordering::Relaxed);
            }
        }
    }

    struct UsbEndpointConfiguration {
        address: u8,
        transfer_type: UsbTransferType,
        /// Index into `ep_control`. EP0 doesn't have one.
        endpoint_control_index: Option<usize>,
        /// Index into `ep_buffer_control`; also this endpoint's bit in
        /// `buff_status`.
        buffer_control_index: usize,
        /// Which of `Buffers` this endpoint uses.
        data_buffer_index: usize,
        /// Whether the next packet is DATA1. Atomic only so it can live in a
        /// `static`.
        next_pid_1: AtomicBool,
    }

    impl UsbEndpointConfiguration {
        /// Register indices follow from the address: control registers start
        /// at EP1 IN, buffer control registers at EP0 IN, IN before OUT.
        const fn new(address: u8, transfer_type: UsbTransferType, data_buffer_index: usize) -> Self {
            let num = (address & 0x0F) as usize;
            let out = (address & 0x80 == 0) as usize;
            Self {
                address,
                transfer_type,
                endpoint_control_index: if num == 0 { None } else { Some((num - 1) * 2 + out) },
                buffer_control_index: num * 2 + out,
                data_buffer_index,
                next_pid_1: AtomicBool::new(false),
            }
        }
    }

    const EP0_IN_ADDR: u8 = UsbDir::In.endpoint(0);
    const EP0_OUT_ADDR: u8 = UsbDir::Out.endpoint(0);

    static EP0_OUT_CFG: UsbEndpointConfiguration =
        UsbEndpointConfiguration::new(EP0_OUT_ADDR, UsbTransferType::Control, 0);
    static EP0_IN_CFG: UsbEndpointConfiguration =
        UsbEndpointConfiguration::new(EP0_IN_ADDR, UsbTransferType::Control, 0);

    const DATA_BUFFERS: usize = 4;

    struct Buffers {
        /// Fixed EP0 buffer, shared by IN and OUT.
        ep0_buffer0: &'static UnsafeCell<[u8; 64]>,
        /// Fixed, and unused: we don't double-buffer EP0.
        ep0_buffer1: &'static UnsafeCell<[u8; 64]>,
        rest: &'static [UnsafeCell<[u8; 64]>; DATA_BUFFERS],
    }

    impl Buffers {
        fn get(&self, i: usize) -> &UnsafeCell<[u8; 64]> {
            match i {
                0 => self.ep0_buffer0,
                1 => self.ep0_buffer1,
                x => &self.rest[x - 2],
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Diagnostic pins.

    #[inline(always)]
    fn raise_pin(sio: &rp2040_pac::SIO, pin: u8) {
        sio.gpio_out_set.write(|w| unsafe { w.bits(1 << pin) });
    }

    #[inline(always)]
    fn lower_pin(sio: &rp2040_pac::SIO, pin: u8) {
        sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << pin) });
    }

    // Second-stage bootloader for the board's flash chip. The 256-byte images
    // come from the board vendor's SDK and aren't part of this repository.
    cfg_if::cfg_if! {
        if #[cfg(feature = "target-feather")] {
            // GigaDevice GD25Q64.
            #[link_section = ".boot_loader"]
            #[used]
            static BOOT2: [u8; 256] = *include_bytes!("rustboot-gd25q64.bin");
        } else if #[cfg(feature = "target-pico")] {
            // Winbond W25Q080.
            #[link_section = ".boot_loader"]
            #[used]
            static BOOT2: [u8; 256] = *include_bytes!("rustboot-w25q080.bin");
        }
    }
}
