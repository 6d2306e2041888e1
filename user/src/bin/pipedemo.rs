//! Standalone pipe exerciser: pushes a stream through a pipe in chunks
//! and checks byte conservation.

#![no_std]
#![no_main]

use ktos_user::syscall;

extern crate ktos_user;

const TOTAL: usize = 16 * 1024;

#[unsafe(no_mangle)]
extern "C" fn main(_argc: usize, _argv: *const *const u8) -> isize {
    let Ok((wfd, rfd)) = syscall::pipe(-1, -1) else {
        let _ = syscall::print("pipedemo: pipe failed");
        return 1;
    };

    match syscall::fork() {
        Ok(0) => {
            let _ = syscall::close(rfd);
            let mut chunk = [0_u8; 256];
            let mut sent = 0;
            while sent < TOTAL {
                for (i, b) in chunk.iter_mut().enumerate() {
                    *b = ((sent + i) % 251) as u8;
                }
                if syscall::write(wfd, &chunk).is_err() {
                    break;
                }
                sent += chunk.len();
            }
            syscall::exit();
        }
        Ok(child) => {
            let _ = syscall::close(wfd);
            let mut buf = [0_u8; 300];
            let mut received = 0;
            let mut corrupt = false;
            loop {
                match syscall::read(rfd, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for (i, &b) in buf[..n].iter().enumerate() {
                            if b != ((received + i) % 251) as u8 {
                                corrupt = true;
                            }
                        }
                        received += n;
                    }
                }
            }
            let _ = syscall::close(rfd);
            let _ = syscall::wait(child);
            if received == TOTAL && !corrupt {
                let _ = syscall::print("pipedemo: ok");
            } else {
                let _ = syscall::print("pipedemo: mismatch");
            }
        }
        Err(_) => {
            let _ = syscall::print("pipedemo: fork failed");
        }
    }
    0
}
