// begin rustme snippet: example
use std::sync::Arc;

use observable::Observable;

fn main() {
    // Create an Observable<u32> which holds a u32 and invokes subscriber
    // handlers whenever a new value is stored.
    let observable = Observable::new(0_u32);
    // Any Arc the caller owns can act as the observer identity. Delivery
    // stops automatically once it is dropped.
    let observer = Arc::new(());
    let subscription = observable.subscribe(&observer, |value| {
        println!("value changed to {value}");
    });

    // Store a sequence of values. Each store synchronously invokes every
    // live handler, in registration order, on this thread.
    for i in 1..=10 {
        observable.set(i);
    }

    // Explicit cancellation is idempotent and immediate.
    subscription.unsubscribe();
    observable.set(11);
}
// end rustme snippet: example

#[test]
fn runs() {
    main()
}
